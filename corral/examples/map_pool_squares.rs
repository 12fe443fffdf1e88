//! Fans a single job out across worker threads with `MapPool`, each worker
//! receiving its 1-based index and a shared argument list.

use std::sync::Arc;

use corral::{MapPool, Value};

fn main() -> Result<(), corral::Error> {
    corral::dev_tracing::init_tracing();

    let f = Arc::new(|worker_index: i32, _args: &[Value]| {
        Ok(vec![Value::Int(i64::from(worker_index) * i64::from(worker_index))])
    });

    let pool = MapPool::spawn(4, f, vec![]);
    let results = pool.join()?;

    println!("squares: {results:?}");
    Ok(())
}
