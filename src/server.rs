//! TCP server for handling memcached connections.
//!
//! The listener task accepts sockets, owns the connection table and spawns
//! one task per connection. Each task frames its byte stream and hands
//! frames to the dispatcher strictly in order.
//!
//! Commands that write through to the backend run on tokio's blocking
//! pool, so a slow durable write holds up only the connection that issued
//! it (and other writers, which queue on the store's mutation lock).

use crate::config::Config;
use crate::connection::{Connection, ConnectionRegistry, Frame, Limits};
use crate::dispatcher::{Dispatcher, Reply};
use crate::protocol::Response;
use crate::stats::Stats;
use crate::storage::Store;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

/// Bytes reserved ahead of each socket read
const READ_CHUNK: usize = 16 * 1024;

/// Listen backlog
const BACKLOG: i32 = 1024;

/// Pause after a failed accept, e.g. when out of file descriptors
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Server instance
pub struct Server {
    config: Config,
    dispatcher: Dispatcher,
    stats: Arc<Stats>,
}

impl Server {
    /// Create a new server over an already loaded store
    pub fn new(config: Config, store: Arc<Store>) -> Self {
        let stats = Arc::new(Stats::new());
        Server {
            config,
            dispatcher: Dispatcher::new(store, Arc::clone(&stats)),
            stats,
        }
    }

    /// Bind the configured address and serve until `shutdown` resolves
    pub async fn run(self, shutdown: impl Future) -> io::Result<()> {
        let addr: SocketAddr = self
            .config
            .listen
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let listener = TcpListener::from_std(create_listener(addr)?)?;
        info!(address = %addr, "Server listening");

        self.serve(listener, shutdown).await
    }

    /// Accept connections on `listener` until `shutdown` resolves
    pub async fn serve(self, listener: TcpListener, shutdown: impl Future) -> io::Result<()> {
        let (closed_tx, mut closed_rx) = mpsc::unbounded_channel::<usize>();
        let mut registry = ConnectionRegistry::new(self.config.max_connections);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!(open = registry.len(), "Shutting down");
                    return Ok(());
                }

                Some(slot) = closed_rx.recv() => {
                    if let Some(info) = registry.remove(slot) {
                        self.stats.connection_closed();
                        debug!(
                            conn_id = info.id,
                            peer = %info.peer,
                            secs = info.opened_at.elapsed().as_secs(),
                            "Connection closed"
                        );
                    }
                }

                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        self.admit(stream, peer, &mut registry, &closed_tx);
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }
    }

    /// Register an accepted socket and spawn its task
    fn admit(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        registry: &mut ConnectionRegistry,
        closed_tx: &mpsc::UnboundedSender<usize>,
    ) {
        let Some((slot, conn_id)) = registry.insert(peer) else {
            warn!(peer = %peer, "Connection limit reached");
            tokio::spawn(async move {
                let mut stream = stream;
                let reply = Response::server_error("too many open connections");
                if let Err(e) = stream.write_all(&reply).await {
                    debug!(peer = %peer, error = %e, "Failed to send rejection");
                }
            });
            return;
        };

        self.stats.connection_opened();
        debug!(conn_id, peer = %peer, "New connection");

        if let Err(e) = stream.set_nodelay(true) {
            debug!(conn_id, error = %e, "Failed to set TCP_NODELAY");
        }
        let conn = Connection::new(
            conn_id,
            Limits {
                max_line_length: self.config.max_line_length,
                max_value_size: self.config.max_value_size,
            },
        );
        let dispatcher = self.dispatcher.clone();
        let idle_timeout = self.config.idle_timeout;
        let closed_tx = closed_tx.clone();

        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, conn, dispatcher, idle_timeout).await {
                debug!(conn_id, error = %e, "Connection error");
            }
            let _ = closed_tx.send(slot);
        });
    }
}

/// Handle a single client connection until it quits, errors or goes idle
pub async fn handle_connection<S>(
    mut stream: S,
    mut conn: Connection,
    dispatcher: Dispatcher,
    idle_timeout: Option<Duration>,
) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let conn_id = conn.id();

    loop {
        // Run every complete frame already buffered
        loop {
            let frame = match conn.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    warn!(conn_id, error = %e, "Framing error, closing connection");
                    stream.write_all(&e.reply()).await?;
                    return Ok(());
                }
            };

            trace!(conn_id, ?frame, "Processing frame");
            match dispatch(&dispatcher, frame).await? {
                Reply::Data(response) => stream.write_all(&response).await?,
                Reply::Close => {
                    trace!(conn_id, "Client quit");
                    return Ok(());
                }
            }
        }

        let buffer = conn.read_buf_mut();
        buffer.reserve(READ_CHUNK);

        let n = match idle_timeout {
            Some(limit) => match tokio::time::timeout(limit, stream.read_buf(buffer)).await {
                Ok(read) => read?,
                Err(_) => {
                    debug!(conn_id, "Idle timeout, closing connection");
                    return Ok(());
                }
            },
            None => stream.read_buf(buffer).await?,
        };

        if n == 0 {
            trace!(conn_id, "Connection closed by client");
            return Ok(());
        }
    }
}

/// Execute a frame, moving backend work off the async workers
async fn dispatch(dispatcher: &Dispatcher, frame: Frame) -> io::Result<Reply> {
    if Dispatcher::touches_backend(&frame) {
        let dispatcher = dispatcher.clone();
        tokio::task::spawn_blocking(move || dispatcher.execute(frame))
            .await
            .map_err(io::Error::other)
    } else {
        Ok(dispatcher.execute(frame))
    }
}

/// Create the listening socket with address reuse enabled
fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(BACKLOG)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MemoryBackend, SqliteBackend};
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio_test::io::Builder;

    fn limits() -> Limits {
        Limits {
            max_line_length: 1024,
            max_value_size: 64,
        }
    }

    fn memory_dispatcher() -> Dispatcher {
        let store = Store::load(Arc::new(MemoryBackend::new())).unwrap();
        Dispatcher::new(store, Arc::new(Stats::new()))
    }

    /// Start a server on an ephemeral port, returning its address.
    async fn spawn_server(store: Arc<Store>, config: Config) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Server::new(config, store);
        tokio::spawn(server.serve(listener, std::future::pending::<()>()));
        addr
    }

    async fn read_line<R: tokio::io::AsyncBufRead + Unpin>(reader: &mut R) -> String {
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        line
    }

    #[tokio::test]
    async fn test_set_get_over_mock_stream() {
        let stream = Builder::new()
            .read(b"set greeting 0 0 5\r\nhello\r\n")
            .write(b"STORED\r\n")
            .read(b"get greeting nope\r\n")
            .write(b"VALUE greeting 0 5\r\nhello\r\nEND\r\n")
            .build();

        let conn = Connection::new(1, limits());
        handle_connection(stream, conn, memory_dispatcher(), None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_fragmented_payload_over_mock_stream() {
        let stream = Builder::new()
            .read(b"se")
            .read(b"t k 1 0 4")
            .read(b"\r")
            .read(b"\nab")
            .read(b"\r")
            .read(b"\n\r")
            .read(b"\nget k\r\n")
            .write(b"STORED\r\n")
            .write(b"VALUE k 0 4\r\nab\r\n\r\nEND\r\n")
            .build();

        let conn = Connection::new(1, limits());
        handle_connection(stream, conn, memory_dispatcher(), None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_quit_stops_processing() {
        let (client, server) = tokio::io::duplex(4096);
        let conn = Connection::new(1, limits());
        let task = tokio::spawn(handle_connection(server, conn, memory_dispatcher(), None));

        let (read_half, mut write_half) = tokio::io::split(client);
        write_half
            .write_all(b"version\r\nquit\r\nget never\r\n")
            .await
            .unwrap();

        let mut reader = BufReader::new(read_half);
        assert_eq!(
            read_line(&mut reader).await,
            concat!("VERSION mcstore ", env!("CARGO_PKG_VERSION"), "\r\n")
        );
        task.await.unwrap().unwrap();

        // Nothing was answered after quit
        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_and_malformed_commands() {
        let stream = Builder::new()
            .read(b"bogus\r\nset k 0 0\r\nget k\r\n")
            .write(b"ERROR\r\n")
            .write(b"CLIENT_ERROR bad command line format\r\n")
            .write(b"END\r\n")
            .build();

        let conn = Connection::new(1, limits());
        handle_connection(stream, conn, memory_dispatcher(), None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_long_key_rejected_before_payload() {
        let long_key = "k".repeat(crate::protocol::MAX_KEY_LENGTH + 1);
        let request = format!("set {long_key} 0 0 1\r\nx\r\ndelete {long_key}\r\n");
        let stream = Builder::new()
            .read(request.as_bytes())
            .write(b"CLIENT_ERROR key too long\r\n")
            // The data block is read as a command line, not as a payload
            .write(b"ERROR\r\n")
            .write(b"CLIENT_ERROR key too long\r\n")
            .build();

        let store = Store::load(Arc::new(MemoryBackend::new())).unwrap();
        let dispatcher = Dispatcher::new(Arc::clone(&store), Arc::new(Stats::new()));
        handle_connection(stream, Connection::new(1, limits()), dispatcher, None)
            .await
            .unwrap();

        assert_eq!(store.len(), 0);
    }

    #[tokio::test]
    async fn test_noreply_still_replies() {
        let stream = Builder::new()
            .read(b"set k 0 0 4 noreply\r\nabcd\r\n")
            .write(b"STORED\r\n")
            .read(b"get k\r\n")
            .write(b"VALUE k 0 4\r\nabcd\r\nEND\r\n")
            .read(b"delete k noreply\r\n")
            .write(b"DELETED\r\n")
            .build();

        let limits = Limits {
            max_line_length: 1024,
            max_value_size: 4,
        };
        handle_connection(stream, Connection::new(1, limits), memory_dispatcher(), None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_stops_accepting() {
        let store = Store::load(Arc::new(MemoryBackend::new())).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();

        let server = Server::new(Config::default(), store);
        let task = tokio::spawn(server.serve(listener, async move {
            let _ = stop_rx.await;
        }));

        stop_tx.send(()).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(2), task).await;
        assert!(matches!(result, Ok(Ok(Ok(())))));
    }

    #[tokio::test]
    async fn test_line_overflow_closes() {
        let mut wire = vec![b'x'; 2048];
        wire.extend_from_slice(b"\r\n");
        let stream = Builder::new()
            .read(&wire)
            .write(b"CLIENT_ERROR line too long\r\n")
            .build();

        let conn = Connection::new(1, limits());
        handle_connection(stream, conn, memory_dispatcher(), None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_idle_timeout_closes() {
        let (_client, server) = tokio::io::duplex(64);
        let conn = Connection::new(1, limits());

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            handle_connection(
                server,
                conn,
                memory_dispatcher(),
                Some(Duration::from_millis(50)),
            ),
        )
        .await;

        assert!(matches!(result, Ok(Ok(()))));
    }

    #[tokio::test]
    async fn test_tcp_round_trip() {
        let store = Store::load(Arc::new(MemoryBackend::new())).unwrap();
        let addr = spawn_server(store, Config::default()).await;

        let stream = TcpStream::connect(addr).await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        write_half
            .write_all(b"set a 0 0 1\r\n1\r\nadd a 0 0 1\r\n2\r\ndelete a\r\ndelete a\r\n")
            .await
            .unwrap();
        assert_eq!(read_line(&mut reader).await, "STORED\r\n");
        assert_eq!(read_line(&mut reader).await, "NOT_STORED\r\n");
        assert_eq!(read_line(&mut reader).await, "DELETED\r\n");
        assert_eq!(read_line(&mut reader).await, "NOT_FOUND\r\n");

        write_half.write_all(b"stats\r\n").await.unwrap();
        let mut saw_connections = false;
        loop {
            let line = read_line(&mut reader).await;
            if line == "END\r\n" {
                break;
            }
            if line == "STAT curr_connections 1\r\n" {
                saw_connections = true;
            }
        }
        assert!(saw_connections);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_add_from_two_connections() {
        let store = Store::load(Arc::new(MemoryBackend::new())).unwrap();
        let addr = spawn_server(Arc::clone(&store), Config::default()).await;

        let attempt = move |value: &'static str| async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            let request = format!("add race 0 0 {}\r\n{}\r\n", value.len(), value);
            stream.write_all(request.as_bytes()).await.unwrap();
            let mut reader = BufReader::new(stream);
            read_line(&mut reader).await
        };

        let (a, b) = tokio::join!(
            tokio::spawn(attempt("left")),
            tokio::spawn(attempt("right"))
        );
        let mut replies = vec![a.unwrap(), b.unwrap()];
        replies.sort();

        assert_eq!(replies, vec!["NOT_STORED\r\n", "STORED\r\n"]);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_connection_limit() {
        let store = Store::load(Arc::new(MemoryBackend::new())).unwrap();
        let config = Config {
            max_connections: 1,
            ..Config::default()
        };
        let addr = spawn_server(store, config).await;

        let mut first = TcpStream::connect(addr).await.unwrap();
        first.write_all(b"version\r\n").await.unwrap();
        let mut first_reader = BufReader::new(&mut first);
        assert!(read_line(&mut first_reader).await.starts_with("VERSION"));

        let second = TcpStream::connect(addr).await.unwrap();
        let mut second_reader = BufReader::new(second);
        assert_eq!(
            read_line(&mut second_reader).await,
            "SERVER_ERROR too many open connections\r\n"
        );
    }

    #[tokio::test]
    async fn test_restart_reloads_from_backend() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.db");

        {
            let store = Store::load(Arc::new(SqliteBackend::open(&path).unwrap())).unwrap();
            let addr = spawn_server(store, Config::default()).await;
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream
                .write_all(b"set a 0 0 1\r\n1\r\nset b 0 0 1\r\n2\r\n")
                .await
                .unwrap();
            let mut reader = BufReader::new(stream);
            assert_eq!(read_line(&mut reader).await, "STORED\r\n");
            assert_eq!(read_line(&mut reader).await, "STORED\r\n");
        }

        let store = Store::load(Arc::new(SqliteBackend::open(&path).unwrap())).unwrap();
        let addr = spawn_server(store, Config::default()).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"get a b\r\n").await.unwrap();

        let mut reader = BufReader::new(stream);
        let mut response = String::new();
        loop {
            let line = read_line(&mut reader).await;
            response.push_str(&line);
            if line == "END\r\n" {
                break;
            }
        }
        assert_eq!(response, "VALUE a 0 1\r\n1\r\nVALUE b 0 1\r\n2\r\nEND\r\n");
    }
}
