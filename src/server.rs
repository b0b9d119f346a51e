//! TCP listener and accept loop.
//!
//! Binds the listening socket, publishes the OS-assigned port, and spawns
//! one task per accepted connection so no client can stall acceptance.

use crate::config::Config;
use crate::connection;
use crate::shutdown::HandleRegistry;
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info};

/// Server instance
pub struct Server {
    listener: TcpListener,
    registry: Arc<HandleRegistry>,
    buffer_size: usize,
}

impl Server {
    /// Bind the listening socket and register its fd for shutdown cleanup.
    ///
    /// The default listen address is the wildcard with port 0, so the OS
    /// assigns the port. The assigned port is printed to stdout so clients
    /// can discover where to connect.
    pub fn bind(config: &Config, registry: Arc<HandleRegistry>) -> std::io::Result<Server> {
        let addr: SocketAddr = config.listen.parse().map_err(|e| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid listen address '{}': {}", config.listen, e),
            )
        })?;

        let listener = create_listener(addr, config.backlog)?;
        registry.register(listener.as_raw_fd());

        let listener = TcpListener::from_std(listener)?;
        let port = listener.local_addr()?.port();

        println!("[Server] Port: {port}");
        info!(port, "Server listening");

        Ok(Server {
            listener,
            registry,
            buffer_size: config.buffer_size,
        })
    }

    /// Port assigned by the OS to the listening socket, for testing
    #[cfg(test)]
    pub fn port(&self) -> u16 {
        self.listener.local_addr().unwrap().port()
    }

    /// Accept connections until a fatal error.
    ///
    /// Every accepted socket is registered for shutdown cleanup before its
    /// handler task is spawned. Handler errors stay local to the task; an
    /// accept error ends the loop and is fatal to the process.
    pub async fn run(&self) -> std::io::Result<()> {
        loop {
            let (stream, addr) = self.listener.accept().await?;
            self.registry.register(stream.as_raw_fd());
            debug!(peer = %addr, "New connection");

            let buffer_size = self.buffer_size;
            tokio::spawn(async move {
                if let Err(e) = connection::handle_connection(stream, addr, buffer_size).await {
                    debug!(peer = %addr, error = %e, "Connection error");
                }
            });
        }
    }
}

/// Create a TCP listener with an explicit backlog.
fn create_listener(addr: SocketAddr, backlog: i32) -> std::io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ACK, GREETING};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    fn test_config() -> Config {
        Config {
            listen: "127.0.0.1:0".to_string(),
            backlog: 5,
            buffer_size: 1024,
            workers: None,
            log_level: "info".to_string(),
        }
    }

    /// Bind a server on a loopback port and run its accept loop in the
    /// background, returning the assigned port.
    fn start_server() -> u16 {
        let registry = Arc::new(HandleRegistry::new());
        let server = Server::bind(&test_config(), registry).unwrap();
        let port = server.port();

        tokio::spawn(async move {
            let _ = server.run().await;
        });

        port
    }

    async fn connect(port: u16) -> TcpStream {
        TcpStream::connect(("127.0.0.1", port)).await.unwrap()
    }

    async fn read_exactly(stream: &mut TcpStream, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        stream.read_exact(&mut buf).await.unwrap();
        buf
    }

    #[tokio::test]
    async fn test_os_assigned_port_is_reachable() {
        let registry = Arc::new(HandleRegistry::new());
        let server = Server::bind(&test_config(), registry).unwrap();
        let port = server.port();

        assert!(port > 0);

        tokio::spawn(async move {
            let _ = server.run().await;
        });

        // The reported port is where clients actually reach the server
        connect(port).await;
    }

    #[tokio::test]
    async fn test_greeting_arrives_first() {
        let port = start_server();

        let mut client = connect(port).await;
        let bytes = read_exactly(&mut client, GREETING.len()).await;
        assert_eq!(bytes, GREETING.as_bytes());
    }

    #[tokio::test]
    async fn test_one_ack_per_chunk_in_order() {
        let port = start_server();

        let mut client = connect(port).await;
        read_exactly(&mut client, GREETING.len()).await;

        client.write_all(b"ping").await.unwrap();
        let bytes = read_exactly(&mut client, ACK.len()).await;
        assert_eq!(bytes, ACK.as_bytes());

        client.write_all(b"pong").await.unwrap();
        let bytes = read_exactly(&mut client, ACK.len()).await;
        assert_eq!(bytes, ACK.as_bytes());
    }

    #[tokio::test]
    async fn test_eof_without_data_gets_no_ack() {
        let port = start_server();

        let mut client = connect(port).await;
        read_exactly(&mut client, GREETING.len()).await;

        client.shutdown().await.unwrap();

        // The handler exits on EOF and closes the socket without sending
        // anything further
        let mut buf = [0u8; 64];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_concurrent_clients_get_their_own_greeting_and_ack() {
        let port = start_server();

        let mut clients = Vec::new();
        for i in 0..8 {
            clients.push(tokio::spawn(async move {
                let mut client = connect(port).await;
                let bytes = read_exactly(&mut client, GREETING.len()).await;
                assert_eq!(bytes, GREETING.as_bytes());

                let message = format!("client {i}");
                client.write_all(message.as_bytes()).await.unwrap();
                let bytes = read_exactly(&mut client, ACK.len()).await;
                assert_eq!(bytes, ACK.as_bytes());

                // Closing our write side ends the handler; nothing beyond
                // the single acknowledgement ever arrives
                client.shutdown().await.unwrap();
                let mut buf = [0u8; 64];
                let n = client.read(&mut buf).await.unwrap();
                assert_eq!(n, 0);
            }));
        }

        for client in clients {
            client.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_slow_client_does_not_block_others() {
        let port = start_server();

        // First client connects and goes quiet
        let mut idle = connect(port).await;
        read_exactly(&mut idle, GREETING.len()).await;

        // Later clients are greeted and acknowledged while the first one
        // sits idle
        for _ in 0..3 {
            let mut client = connect(port).await;
            read_exactly(&mut client, GREETING.len()).await;
            client.write_all(b"hello").await.unwrap();
            let bytes = read_exactly(&mut client, ACK.len()).await;
            assert_eq!(bytes, ACK.as_bytes());
        }

        // The idle client's connection still works
        idle.write_all(b"still here").await.unwrap();
        let bytes = read_exactly(&mut idle, ACK.len()).await;
        assert_eq!(bytes, ACK.as_bytes());
    }

    #[tokio::test]
    async fn test_every_socket_is_registered_for_cleanup() {
        let registry = Arc::new(HandleRegistry::new());
        let server = Server::bind(&test_config(), Arc::clone(&registry)).unwrap();
        let port = server.port();

        tokio::spawn(async move {
            let _ = server.run().await;
        });

        // Listener fd
        assert_eq!(registry.len(), 1);

        let mut client = connect(port).await;
        read_exactly(&mut client, GREETING.len()).await;

        // Listener fd plus the accepted connection's fd
        assert_eq!(registry.len(), 2);
    }
}
