//! TCP front door: binds a listener and hands every accepted connection to
//! its own [Connection] task with a fresh engine instance.

use crate::connection::{Connection, ConnectionOptions};
use crate::engine::Engine;
use std::pin::Pin;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Where the server listens, plus the tunables every accepted connection
/// starts from. Defaults to the loopback interface on the standard Postgres
/// port with default connection tunables.
pub struct ServerOptions {
	addr: String,
	port: u16,
	connection: ConnectionOptions,
}

impl Default for ServerOptions {
	fn default() -> Self {
		Self {
			addr: "127.0.0.1".to_owned(),
			port: 5432,
			connection: ConnectionOptions::default(),
		}
	}
}

impl ServerOptions {
	/// The default listener configuration.
	pub fn new() -> Self {
		Self::default()
	}

	/// Picks the port to bind. Port 0 asks the OS for an ephemeral one.
	pub fn with_port(mut self, port: u16) -> Self {
		self.port = port;
		self
	}

	/// Picks the address to bind.
	pub fn with_addr(mut self, addr: impl Into<String>) -> Self {
		self.addr = addr.into();
		self
	}

	/// Listens on every interface instead of just the loopback address.
	pub fn on_all_interfaces(self) -> Self {
		self.with_addr("0.0.0.0")
	}

	/// Per-connection tunables: buffer bounds, blob limit, recompile cap.
	pub fn with_connection_options(mut self, options: ConnectionOptions) -> Self {
		self.connection = options;
		self
	}
}

type EngineFunc<E> = Arc<dyn Fn() -> Pin<Box<dyn futures::Future<Output = E> + Send>> + Send + Sync>;

async fn accept_loop<E: Engine>(
	listener: TcpListener,
	engine_func: EngineFunc<E>,
	options: ConnectionOptions,
) -> std::io::Result<()> {
	loop {
		let (stream, peer) = listener.accept().await?;
		tracing::debug!(%peer, "accepted connection");
		let engine_func = engine_func.clone();
		let options = options.clone();
		tokio::spawn(async move {
			let mut conn = Connection::new(engine_func().await, options);
			if let Err(e) = conn.run(stream).await {
				tracing::debug!("connection ended: {}", e);
			}
		});
	}
}

/// Serves until the listener fails. `engine_func` produces one engine per
/// accepted connection.
pub async fn run<E: Engine>(options: ServerOptions, engine_func: EngineFunc<E>) -> std::io::Result<()> {
	let listener = TcpListener::bind((options.addr, options.port)).await?;
	accept_loop(listener, engine_func, options.connection).await
}

/// Binds, moves the accept loop into a background task, and returns the
/// bound port. Test harnesses bind port 0 and connect to whatever came back.
pub async fn run_background<E: Engine>(options: ServerOptions, engine_func: EngineFunc<E>) -> std::io::Result<u16> {
	let listener = TcpListener::bind((options.addr, options.port)).await?;
	let port = listener.local_addr()?.port();

	tokio::spawn(async move { accept_loop(listener, engine_func, options.connection).await });

	Ok(port)
}
