//! TCP server accepting and fanning out to many clients.
//!
//! Grounded on `cliser.c`'s `server_t`/`client_t` doubly-linked client list
//! (`insert_client`/`remove_client`/`compare_clients`), `cliser_server`,
//! `cliser_server_clients`'s accept-with-30s-select-window loop (which also
//! runs `can_use_fastpath` on every freshly accepted socket, the accepting
//! side's half of the same handshake [`crate::client::Client::connect`]
//! performs when connecting), and
//! `cliser_server_broadcast`/`cliser_server_recv_any`.

use std::net::{TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

use corral_core::handle::HandleRegistry;
use corral_core::ring::RingBuffer;
use corral_core::value::Value;
use tracing::{debug, warn};

use crate::error::{Result, TransportError};
use crate::fastpath::{self, CopyContext, DeviceBackend, NetStats, NullDeviceBackend};
use crate::framing;
use crate::options::TransportOptions;
use crate::tcp;

/// One accepted connection, identified by a server-assigned `id` and an
/// optional caller-assigned `tag` (`cliser_server_tag`/`cliser_server_id`).
pub struct Connection {
    id: i32,
    tag: Option<String>,
    stream: TcpStream,
    send_scratch: RingBuffer,
    recv_scratch: RingBuffer,
    pub copy_context: CopyContext,
}

impl Connection {
    /// Negotiates the fast path over `stream` exactly as the connecting
    /// side does (`can_use_fastpath`, called symmetrically on both ends of
    /// the just-accepted socket per `cliser_server_clients`), then wraps it
    /// as a fresh `Connection`.
    fn new(stream: TcpStream, options: &TransportOptions, backend: &dyn DeviceBackend) -> Result<Self> {
        let mut copy_context = CopyContext::new(options);
        copy_context.use_fastpath = fastpath::negotiate_fastpath(&stream, backend)?;
        Ok(Self {
            id: 0,
            tag: None,
            stream,
            send_scratch: RingBuffer::new(options.inline_size_cap),
            recv_scratch: RingBuffer::new(options.inline_size_cap),
            copy_context,
        })
    }

    #[must_use]
    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn set_id(&mut self, id: i32) {
        self.id = id;
    }

    #[must_use]
    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn set_tag(&mut self, tag: impl Into<String>) {
        self.tag = Some(tag.into());
    }

    /// Peer address, mirroring `cliser_server_client_address`.
    pub fn peer_address(&self) -> Result<std::net::SocketAddr> {
        self.stream.peer_addr().map_err(TransportError::io)
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

    fn close(&mut self) {
        let _ = framing::send_close_sentinel(&mut self.stream);
    }
}

/// Listens for and fans out to TCP clients. One server owns an unbounded
/// number of [`Connection`]s, each independently framed.
pub struct Server {
    listener: TcpListener,
    port: u16,
    clients: Vec<Connection>,
    next_client_id: i32,
    options: TransportOptions,
    backend: Arc<dyn DeviceBackend>,
}

impl Server {
    /// Binds `host:port` (`port == 0` picks an ephemeral port, returned via
    /// [`Self::port`]), mirroring `cliser_server`'s default host
    /// `127.0.0.1` and `luaL_optinteger` port default of `0`. Accepted
    /// connections never propose the fast path, the same always-available
    /// case as [`crate::client::Client::connect_host_only`].
    pub fn bind(host: &str, port: u16, options: TransportOptions) -> Result<Self> {
        Self::bind_with_backend(host, port, options, NullDeviceBackend)
    }

    /// Like [`Self::bind`], but negotiates the fast path against `backend`
    /// on every accepted connection, mirroring `cliser_server_clients`'
    /// own `can_use_fastpath` call on the accepting side.
    pub fn bind_with_backend<B: DeviceBackend + 'static>(
        host: &str,
        port: u16,
        options: TransportOptions,
        backend: B,
    ) -> Result<Self> {
        let listener = TcpListener::bind((host, port)).map_err(TransportError::io)?;
        let bound_port = listener.local_addr().map_err(TransportError::io)?.port();
        debug!(host, port = bound_port, "server bound");
        Ok(Self {
            listener,
            port: bound_port,
            clients: Vec::new(),
            next_client_id: 0,
            options,
            backend: Arc::new(backend),
        })
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    #[must_use]
    pub fn num_clients(&self) -> usize {
        self.clients.len()
    }

    /// Accepts connections until at least `wait_count` are available (or
    /// the already-connected count already satisfies it), polling the
    /// listening socket in 30-second windows against an overall
    /// `DEFAULT_TIMEOUT_SECONDS` deadline, mirroring
    /// `cliser_server_clients`'s accept loop. Returns
    /// [`TransportError::Timeout`] if the deadline passes first.
    pub fn accept_until(&mut self, wait_count: usize) -> Result<()> {
        let deadline = Instant::now() + self.options.connect_timeout;
        while self.clients.len() < wait_count {
            let window = Duration::from_secs(30);
            let ready = crate::select::select_readable(&[self.listener.as_raw_fd()], Some(window))?;
            if !ready.is_empty() {
                let (stream, addr) = self.listener.accept().map_err(TransportError::io)?;
                tcp::configure(&stream, &self.options).map_err(TransportError::io)?;
                let mut conn = Connection::new(stream, &self.options, self.backend.as_ref())?;
                conn.set_id(self.next_client_id);
                self.next_client_id += 1;
                debug!(addr = %addr, id = conn.id(), fastpath = conn.copy_context.use_fastpath, "client accepted");
                self.clients.push(conn);
            }
            if Instant::now() > deadline {
                return Err(TransportError::Timeout);
            }
        }
        Ok(())
    }

    /// Invokes `callback` once per matching client in ascending id order
    /// (descending if `invert_order`), after first accepting until at
    /// least `wait_count` clients are present. Mirrors
    /// `cliser_server_clients`'s sort-then-iterate behavior.
    pub fn for_each_client<F>(
        &mut self,
        wait_count: usize,
        tag_filter: Option<&str>,
        invert_order: bool,
        mut callback: F,
    ) -> Result<usize>
    where
        F: FnMut(&mut Connection) -> Result<()>,
    {
        self.accept_until(wait_count)?;

        let mut indices: Vec<usize> = self
            .clients
            .iter()
            .enumerate()
            .filter(|(_, c)| tag_filter.map_or(true, |t| c.tag() == Some(t)))
            .map(|(i, _)| i)
            .collect();
        indices.sort_by_key(|&i| self.clients[i].id());
        if invert_order {
            indices.reverse();
        }

        let mut touched = 0;
        for i in indices {
            callback(&mut self.clients[i])?;
            touched += 1;
        }
        Ok(touched)
    }

    /// Sends `value` to every matching client in ascending id order,
    /// aborting at the first error, mirroring `cliser_server_broadcast`.
    pub fn broadcast(&mut self, handles: &HandleRegistry, value: &Value, tag_filter: Option<&str>) -> Result<()> {
        let mut indices: Vec<usize> = self
            .clients
            .iter()
            .enumerate()
            .filter(|(_, c)| tag_filter.map_or(true, |t| c.tag() == Some(t)))
            .map(|(i, _)| i)
            .collect();
        indices.sort_by_key(|&i| self.clients[i].id());

        for i in indices {
            self.clients[i].send(handles, value)?;
        }
        Ok(())
    }

    /// Blocks until any matching client has a message ready, receives it,
    /// and returns `(client_index, value)`, mirroring
    /// `cliser_server_recv_any`'s `select` across all matching sockets.
    /// `client_index` indexes into [`Self::connection`]/[`Self::connection_mut`].
    pub fn recv_any(&mut self, handles: &HandleRegistry, tag_filter: Option<&str>) -> Result<(usize, Value)> {
        let candidates: Vec<(usize, std::os::unix::io::RawFd)> = self
            .clients
            .iter()
            .enumerate()
            .filter(|(_, c)| tag_filter.map_or(true, |t| c.tag() == Some(t)))
            .map(|(i, c)| (i, c.stream.as_raw_fd()))
            .collect();
        if candidates.is_empty() {
            return Err(TransportError::NoSuchClient("no clients match the given tag".into()));
        }
        let fds: Vec<_> = candidates.iter().map(|(_, fd)| *fd).collect();
        let ready = crate::select::select_readable(&fds, None)?;
        let ready_fd = *ready.first().ok_or(TransportError::Timeout)?;
        let (index, _) = candidates
            .into_iter()
            .find(|(_, fd)| *fd == ready_fd)
            .expect("select returned a watched fd");
        let value = self.clients[index].recv(handles)?;
        Ok((index, value))
    }

    #[must_use]
    pub fn connection(&self, index: usize) -> Option<&Connection> {
        self.clients.get(index)
    }

    pub fn connection_mut(&mut self, index: usize) -> Option<&mut Connection> {
        self.clients.get_mut(index)
    }

    /// Drops a client connection, sending the close sentinel first,
    /// mirroring `cliser_server_client_close`.
    pub fn close_connection(&mut self, index: usize) {
        if index < self.clients.len() {
            let mut conn = self.clients.remove(index);
            conn.close();
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        for conn in &mut self.clients {
            conn.close();
        }
        if !self.clients.is_empty() {
            warn!(count = self.clients.len(), "server dropped with clients still attached");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corral_core::value::Value;
    use std::thread;

    #[test]
    fn accept_until_blocks_until_count_satisfied() {
        let mut server = Server::bind("127.0.0.1", 0, TransportOptions::default()).unwrap();
        let port = server.port();
        let connector = thread::spawn(move || {
            let _s1 = TcpStream::connect(("127.0.0.1", port)).unwrap();
            let _s2 = TcpStream::connect(("127.0.0.1", port)).unwrap();
            thread::sleep(Duration::from_millis(50));
        });
        server.accept_until(2).unwrap();
        assert_eq!(server.num_clients(), 2);
        connector.join().unwrap();
    }

    #[test]
    fn broadcast_reaches_every_connected_client() {
        let mut server = Server::bind("127.0.0.1", 0, TransportOptions::default()).unwrap();
        let port = server.port();
        let connector = thread::spawn(move || {
            let mut a = TcpStream::connect(("127.0.0.1", port)).unwrap();
            let mut b = TcpStream::connect(("127.0.0.1", port)).unwrap();
            let handles = HandleRegistry::new();
            let mut scratch_a = RingBuffer::new(16 * 1024);
            let mut scratch_b = RingBuffer::new(16 * 1024);
            let mut stats = NetStats::default();
            let va = framing::recv_msg(&mut a, &mut scratch_a, &handles, &mut stats).unwrap();
            let vb = framing::recv_msg(&mut b, &mut scratch_b, &handles, &mut stats).unwrap();
            (va, vb)
        });
        server.accept_until(2).unwrap();
        let handles = HandleRegistry::new();
        server.broadcast(&handles, &Value::Int(7), None).unwrap();
        let (va, vb) = connector.join().unwrap();
        assert!(matches!(va, Value::Int(7)));
        assert!(matches!(vb, Value::Int(7)));
    }

    #[test]
    fn tag_filter_restricts_broadcast_targets() {
        let mut server = Server::bind("127.0.0.1", 0, TransportOptions::default()).unwrap();
        let port = server.port();
        let connector = thread::spawn(move || {
            let a = TcpStream::connect(("127.0.0.1", port)).unwrap();
            let b = TcpStream::connect(("127.0.0.1", port)).unwrap();
            thread::sleep(Duration::from_millis(50));
            (a, b)
        });
        server.accept_until(2).unwrap();
        let (_a, _b) = connector.join().unwrap();
        server.connection_mut(0).unwrap().set_tag("workers");
        let handles = HandleRegistry::new();
        let touched = server
            .for_each_client(2, Some("workers"), false, |_conn| Ok(()))
            .unwrap();
        assert_eq!(touched, 1);
        let _ = handles;
    }
}
