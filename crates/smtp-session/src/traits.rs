use std::fmt::Debug;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;

pub trait SessionStream: AsyncRead + AsyncWrite + Debug + Unpin + Send {}
impl SessionStream for TcpStream {}
impl SessionStream for TlsStream<TcpStream> {}
impl SessionStream for TlsStream<BoxedSessionStream> {}
#[cfg(test)]
impl SessionStream for tokio::io::DuplexStream {}

pub type BoxedSessionStream = Box<dyn SessionStream>;
