//! The per-connection read/dispatch/write loop, lifted directly from the
//! teacher's `smtp/connection.rs` with the AUTH-ingest branch removed (this
//! relay never issues `SessionReply::IngestAuth`).
//!
//! Unlike the teacher, which always terminates TLS before the first SMTP
//! byte, this relay advertises opportunistic STARTTLS (spec.md §6): the
//! socket starts out plaintext and [`Stream`] is upgraded in place the
//! moment a `STARTTLS` command is accepted.

use std::{
    net::SocketAddr,
    pin::Pin,
    task::{Context, Poll},
};

use smtp_proto::Request;
use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader},
    net::TcpStream,
};
use tokio_rustls::{TlsAcceptor, server::TlsStream};
use tracing::{debug, info, trace};

use crate::smtp::{
    RelayServices,
    session::{DataReply, SessionReply, SmtpSession},
};

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("failed to accept connection: {0}")]
    Accept(std::io::Error),
    #[error("failed to write tcp stream: {0}")]
    Write(std::io::Error),
    #[error("failed to read tcp stream: {0}")]
    Read(std::io::Error),
    #[error("connection dropped unexpectedly")]
    Dropped,
}

const BUFFER_SIZE: usize = 1024;
const CODE_READY: u16 = 220;

/// Either side of the STARTTLS upgrade, so the read/dispatch loop doesn't
/// need to know which one it currently holds.
enum Stream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Stream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Stream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_flush(cx),
            Stream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Stream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

pub async fn handle(
    stream: TcpStream,
    server_name: &str,
    peer_addr: SocketAddr,
    services: RelayServices,
    tls_acceptor: Option<TlsAcceptor>,
) -> Result<(), ConnectionError> {
    let mut buffer = Vec::with_capacity(BUFFER_SIZE);
    let mut session = SmtpSession::new(peer_addr, services, tls_acceptor.is_some());

    let mut reader = BufReader::new(Stream::Plain(stream));

    trace!("handling connection with {}", session.peer());

    write_reply(CODE_READY, server_name, &mut reader).await?;

    'session: loop {
        read_line(&mut reader, &mut buffer).await?;

        let request = Request::parse(&mut buffer.iter());

        trace!("received request: {:?}", request);

        match session.handle(request).await {
            SessionReply::ReplyAndContinue(code, message) => {
                write_reply(code, &message, &mut reader).await?;
                continue;
            }
            SessionReply::ReplyAndStop(code, message) => {
                write_reply(code, &message, &mut reader).await?;
                break;
            }
            SessionReply::RawReply(buf) => {
                reader.write(&buf).await.map_err(ConnectionError::Write)?;
                continue;
            }
            SessionReply::StartTls(code, message) => {
                write_reply(code, &message, &mut reader).await?;

                let Some(acceptor) = tls_acceptor.clone() else {
                    continue;
                };

                let Stream::Plain(tcp) = reader.into_inner() else {
                    unreachable!("STARTTLS only offered while plaintext");
                };

                let tls = acceptor.accept(tcp).await.map_err(ConnectionError::Accept)?;
                reader = BufReader::new(Stream::Tls(Box::new(tls)));
                session.mark_tls_active();
                continue;
            }
            SessionReply::IngestData(code, message) => {
                write_reply(code, &message, &mut reader).await?;

                'data: loop {
                    read_buf(&mut reader, &mut buffer).await?;

                    match session.handle_data(&buffer).await {
                        DataReply::ContinueIngest => continue 'data,
                        DataReply::ReplyAndContinue(code, message) => {
                            write_reply(code, &message, &mut reader).await?;
                            continue 'session;
                        }
                    }
                }
            }
        }
    }

    info!("connection handled");

    Ok(())
}

async fn read_buf(
    reader: impl AsyncBufReadExt + Unpin,
    buffer: &mut Vec<u8>,
) -> Result<usize, ConnectionError> {
    buffer.clear();

    reader
        .take(BUFFER_SIZE as u64)
        .read_buf(buffer)
        .await
        .map_err(ConnectionError::Read)
        .and_then(|size| {
            if size > 0 {
                Ok(size)
            } else {
                Err(ConnectionError::Dropped)
            }
        })
}

async fn read_line(
    reader: impl AsyncBufReadExt + Unpin,
    buffer: &mut Vec<u8>,
) -> Result<usize, ConnectionError> {
    buffer.clear();

    reader
        .take(BUFFER_SIZE as u64)
        .read_until(b'\n', buffer)
        .await
        .map_err(ConnectionError::Read)
        .and_then(|size| {
            if size > 0 {
                Ok(size)
            } else {
                Err(ConnectionError::Dropped)
            }
        })
}

async fn write_reply(
    code: u16,
    message: &str,
    mut sink: impl AsyncWriteExt + Unpin,
) -> Result<(), ConnectionError> {
    let n = sink
        .write(format!("{code} {message}\r\n").as_bytes())
        .await
        .map_err(ConnectionError::Write)?;

    if n < 256 {
        debug!("sent: {} {}", code, message);
    } else {
        trace!("sent {} bytes", n);
    }

    Ok(())
}
