//! Minimal client/server round trip.
//!
//! Starts a server on an ephemeral port, connects one client, sends a
//! single value, and prints what the server received.
//!
//! Run with `RUST_LOG=debug cargo run --example hello_server` to see the
//! transport's `tracing` output.

use corral::{Client, HandleRegistry, Server, TransportOptions, Value};

fn main() -> Result<(), corral::Error> {
    corral::dev_tracing::init_tracing();

    let mut server = Server::bind("127.0.0.1", 0, TransportOptions::default())?;
    let port = server.port();
    println!("listening on 127.0.0.1:{port}");

    let mut client = Client::connect_host_only("127.0.0.1", port, TransportOptions::default())?;
    let handles = HandleRegistry::new();
    client.send(&handles, &Value::Str("hello from the client".into()))?;

    server.accept_until(1)?;
    let value = server.connection_mut(0).unwrap().recv(&handles)?;
    println!("server received: {value:?}");

    Ok(())
}
