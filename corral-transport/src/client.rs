//! TCP client: connect-with-retry plus framed send/recv.
//!
//! Grounded on `cliser.c`'s `cliser_client` (5-minute/1Hz connect retry
//! loop, socket configuration, `can_use_fastpath`'s device-index handshake)
//! and `cliser_client_send`/`cliser_client_recv`/`cliser_client_recv_async`.

use std::net::TcpStream;
use std::time::{Duration, Instant};

use corral_core::handle::HandleRegistry;
use corral_core::ring::RingBuffer;
use corral_core::value::Value;
use tracing::{debug, warn};

use crate::error::{Result, TransportError};
use crate::fastpath::{self, CopyContext, DeviceBackend, NullDeviceBackend};
use crate::framing;
use crate::options::TransportOptions;
use crate::tcp;

/// A connected client socket with its own send/recv framing state.
pub struct Client {
    stream: TcpStream,
    send_scratch: RingBuffer,
    recv_scratch: RingBuffer,
    pub copy_context: CopyContext,
}

impl Client {
    /// Connects to `host:port`, retrying once a second until
    /// [`TransportOptions::connect_timeout`] elapses, mirroring
    /// `cliser_client`'s `while (tv.tv_sec < t) { ...; sleep(1); }` loop.
    /// Negotiates the fast path via `backend` exactly as
    /// `can_use_fastpath` does: only when connecting to the same address
    /// the local socket bound from, and only when both ends report a
    /// device.
    pub fn connect<B: DeviceBackend>(host: &str, port: u16, options: TransportOptions, backend: &B) -> Result<Self> {
        let deadline = Instant::now() + options.connect_timeout;
        let stream = loop {
            match TcpStream::connect((host, port)) {
                Ok(stream) => break stream,
                Err(e) => {
                    if Instant::now() >= deadline {
                        return Err(TransportError::io(e));
                    }
                    std::thread::sleep(Duration::from_secs(1));
                }
            }
        };
        tcp::configure(&stream, &options).map_err(TransportError::io)?;

        let mut copy_context = CopyContext::new(&options);
        copy_context.use_fastpath = fastpath::negotiate_fastpath(&stream, backend)?;
        debug!(host, port, fastpath = copy_context.use_fastpath, "client connected");

        Ok(Self {
            stream,
            send_scratch: RingBuffer::new(options.inline_size_cap),
            recv_scratch: RingBuffer::new(options.inline_size_cap),
            copy_context,
        })
    }

    /// Connects without a device backend — the always-available
    /// non-fast-path case.
    pub fn connect_host_only(host: &str, port: u16, options: TransportOptions) -> Result<Self> {
        Self::connect(host, port, options, &NullDeviceBackend)
    }

    pub fn send(&mut self, handles: &HandleRegistry, value: &Value) -> Result<()> {
        framing::send_msg(
            &mut self.stream,
            &mut self.send_scratch,
            handles,
            value,
            &mut self.copy_context.tx,
        )
    }

    pub fn recv(&mut self, handles: &HandleRegistry) -> Result<Value> {
        framing::recv_msg(
            &mut self.stream,
            &mut self.recv_scratch,
            handles,
            &mut self.copy_context.rx,
        )
    }

    /// Non-blocking variant of [`Self::recv`]: returns `Ok(None)` rather
    /// than blocking when no full message is yet available, mirroring
    /// `cliser_client_recv_async`'s `MSG_PEEK | MSG_DONTWAIT` probe.
    pub fn try_recv(&mut self, handles: &HandleRegistry) -> Result<Option<Value>> {
        if !framing::has_pending_message(&self.stream)? {
            return Ok(None);
        }
        self.recv(handles).map(Some)
    }

    pub fn net_stats(&self) -> (crate::fastpath::NetStats, crate::fastpath::NetStats) {
        (self.copy_context.tx, self.copy_context.rx)
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if framing::send_close_sentinel(&mut self.stream).is_err() {
            warn!("client dropped without a clean close handshake");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fastpath::{DeviceHandle, ImportedPointer};
    use crate::server::Server;
    use std::thread;

    /// A backend that is always available and always reports the same
    /// device index, used to drive the fast-path handshake end to end
    /// without a real GPU.
    struct FakeBackend;

    impl DeviceBackend for FakeBackend {
        fn is_available(&self) -> bool {
            true
        }
        fn device_index(&self) -> i32 {
            0
        }
        fn export(&self, _original_pointer: u64, _byte_count: usize) -> DeviceHandle {
            DeviceHandle(vec![0u8; 8])
        }
        fn import(&self, _handle: &DeviceHandle) -> ImportedPointer {
            ImportedPointer(1)
        }
        fn close_import(&self, _imported: ImportedPointer) {}
        fn device_copy(&self, _dst: ImportedPointer, _src_host: &[u8]) {}
        fn device_copy_to_host(&self, _dst_host: &mut [u8], _src: ImportedPointer) {}
        fn synchronize(&self) {}
        fn peer_access_possible(&self, _other_device: i32) -> bool {
            true
        }
    }

    #[test]
    fn fastpath_handshake_is_symmetric_between_client_and_server() {
        let mut server = Server::bind_with_backend("127.0.0.1", 0, TransportOptions::default(), FakeBackend).unwrap();
        let port = server.port();
        let server_thread = thread::spawn(move || {
            server.accept_until(1).unwrap();
            server.connection(0).unwrap().copy_context.use_fastpath
        });

        let client = Client::connect("127.0.0.1", port, TransportOptions::default(), &FakeBackend).unwrap();

        let server_fastpath = server_thread.join().unwrap();
        assert!(server_fastpath, "server side should have agreed to the fast path");
        assert!(client.copy_context.use_fastpath, "client side should have agreed to the fast path");
    }

    #[test]
    fn connects_and_exchanges_one_message() {
        let mut server = Server::bind("127.0.0.1", 0, TransportOptions::default()).unwrap();
        let port = server.port();
        let server_thread = thread::spawn(move || {
            server.accept_until(1).unwrap();
            let handles = HandleRegistry::new();
            let value = server.connection_mut(0).unwrap().recv(&handles).unwrap();
            value
        });

        let mut client = Client::connect_host_only("127.0.0.1", port, TransportOptions::default()).unwrap();
        let handles = HandleRegistry::new();
        client.send(&handles, &Value::Bool(true)).unwrap();

        let received = server_thread.join().unwrap();
        assert!(matches!(received, Value::Bool(true)));
    }

    #[test]
    fn connect_without_listener_times_out_quickly_with_short_timeout() {
        let mut options = TransportOptions::default();
        options.connect_timeout = Duration::from_millis(50);
        // port 0 on connect is invalid; use a closed port instead by binding
        // and dropping immediately to get a likely-refused port.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let result = Client::connect_host_only("127.0.0.1", port, options);
        assert!(result.is_err());
    }
}
