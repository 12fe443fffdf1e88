//! End-to-end owner/non-owner rendezvous scenario.

use std::thread;

use corral_core::value::Value;
use corral_sync::channel::Status;
use corral_sync::workqueue::WorkQueue;

#[test]
fn owner_non_owner_rendezvous_and_drain() {
    let name = format!("rendezvous-{}", std::process::id());
    let (owner, creator) = WorkQueue::open(Some(&name));
    assert!(creator);

    let non_owner_name = name.clone();
    let handle = thread::spawn(move || {
        let (non_owner, creator) = WorkQueue::open(Some(&non_owner_name));
        assert!(!creator);

        let (status, value) = non_owner.read(false).unwrap();
        assert_eq!(status, Status::Open);
        assert!(matches!(value, Some(Value::Int(42))));
        non_owner.write(&[Value::Int(7)]).unwrap();

        let (status, value) = non_owner.read(false).unwrap();
        assert_eq!(status, Status::Open);
        assert!(matches!(value, Some(Value::Int(100))));
        non_owner.write(&[Value::Int(-100)]).unwrap();
    });

    owner.write(&[Value::Int(42)]).unwrap();
    let (status, value) = owner.read(false).unwrap();
    assert_eq!(status, Status::Open);
    assert!(matches!(value, Some(Value::Int(7))));

    owner.write(&[Value::Int(100)]).unwrap();
    owner.drain().unwrap();

    let (status, value) = owner.read(false).unwrap();
    assert_eq!(status, Status::Open);
    assert!(matches!(value, Some(Value::Int(-100))));

    handle.join().unwrap();
    owner.close();
}
