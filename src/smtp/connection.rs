//! Per-connection I/O driver (§4.E), grounded on the teacher's own
//! `connection::handle` read/write loop (same file, prior revision) for the
//! command/DATA ingest shape, and on
//! `examples/other_examples/bc962c4c_delfour-co-workspace--gk__mail-rs-src-smtp-session.rs.rs`
//! for the `MailStream` STARTTLS upgrade pattern: a unified stream enum
//! swapped in place via `std::mem::replace`, never re-dialed.

use std::{
    net::SocketAddr,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use smtp_proto::Request;
use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf},
    net::TcpStream,
    time::timeout,
};
use tokio_rustls::{TlsAcceptor, server::TlsStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::{
    forwarder::Forwarder,
    recipients::Directory,
    smtp::session::{DataReply, SessionReply, SmtpSession},
    validator::Validator,
};

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("failed to accept connection: {0}")]
    Accept(std::io::Error),
    #[error("failed to write tcp stream: {0}")]
    Write(std::io::Error),
    #[error("failed to read tcp stream: {0}")]
    Read(std::io::Error),
    #[error("TLS handshake failed: {0}")]
    Tls(std::io::Error),
    #[error("connection dropped unexpectedly")]
    Dropped,
    #[error("client timed out")]
    Timeout,
    #[error("command line exceeded {MAX_LINE_LENGTH} octets")]
    LineTooLong,
}

const BUFFER_SIZE: usize = 1024;
const CODE_READY: u16 = 220;

/// RFC 5321 §4.5.3.1.4: command lines (excluding CRLF) may not exceed 512 octets.
const MAX_LINE_LENGTH: usize = 512;
/// RFC 5321 §4.5.3.2.6/.7: time limit for any single command.
const COMMAND_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5 * 60);
/// RFC 5321 §4.5.3.2.5: time limit between successive DATA chunks.
const DATA_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10 * 60);

/// Unified plain/TLS stream so STARTTLS can upgrade in place instead of
/// re-dialing.
pub enum MailStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
    /// Transient placeholder during the STARTTLS handshake; never observed
    /// by callers.
    Upgrading,
}

impl AsyncRead for MailStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            MailStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            MailStream::Tls(s) => Pin::new(s).poll_read(cx, buf),
            MailStream::Upgrading => panic!("I/O on MailStream during STARTTLS upgrade"),
        }
    }
}

impl AsyncWrite for MailStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            MailStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            MailStream::Tls(s) => Pin::new(s).poll_write(cx, buf),
            MailStream::Upgrading => panic!("I/O on MailStream during STARTTLS upgrade"),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            MailStream::Plain(s) => Pin::new(s).poll_flush(cx),
            MailStream::Tls(s) => Pin::new(s).poll_flush(cx),
            MailStream::Upgrading => panic!("I/O on MailStream during STARTTLS upgrade"),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            MailStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            MailStream::Tls(s) => Pin::new(s).poll_shutdown(cx),
            MailStream::Upgrading => panic!("I/O on MailStream during STARTTLS upgrade"),
        }
    }
}

#[allow(clippy::too_many_arguments)]
pub async fn handle(
    stream: TcpStream,
    server_name: &str,
    peer_addr: SocketAddr,
    tls_acceptor: Arc<TlsAcceptor>,
    tls_required: bool,
    validator: Arc<Validator>,
    directory: Arc<dyn Directory>,
    forwarder: Arc<dyn Forwarder>,
    hostname: String,
    cancel: CancellationToken,
) -> Result<(), ConnectionError> {
    let mut stream = MailStream::Plain(stream);
    let mut buffer = Vec::with_capacity(BUFFER_SIZE);
    let mut session = SmtpSession::new(
        peer_addr,
        validator,
        directory,
        forwarder,
        hostname,
        tls_required,
        cancel.clone(),
    );

    // Whatever ends this connection, the session is over: cancel its token
    // so any still-running validator check tied to it tears down too (§5).
    let _guard = cancel.drop_guard();

    trace!("handling connection with {}", session.peer());

    write_reply(CODE_READY, server_name, &mut stream).await?;

    let mut reader = BufReader::new(&mut stream);

    'session: loop {
        read_line(&mut reader, &mut buffer).await?;

        let request = Request::parse(&mut buffer.iter());

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
                reader.write_all(&buf).await.map_err(ConnectionError::Write)?;
                continue;
            }
            SessionReply::StartTls(code, message) => {
                write_reply(code, &message, &mut reader).await?;

                // Drop the BufReader (it borrows `stream`) before swapping
                // the underlying stream variant in place.
                drop(reader);

                let tcp = match std::mem::replace(&mut stream, MailStream::Upgrading) {
                    MailStream::Plain(tcp) => tcp,
                    _ => unreachable!("STARTTLS only offered on a plain stream"),
                };

                let tls_stream = tls_acceptor
                    .accept(tcp)
                    .await
                    .map_err(ConnectionError::Tls)?;

                stream = MailStream::Tls(Box::new(tls_stream));
                session.mark_tls_active();

                reader = BufReader::new(&mut stream);
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

    timeout(
        DATA_TIMEOUT,
        reader.take(BUFFER_SIZE as u64).read_buf(buffer),
    )
    .await
    .map_err(|_| ConnectionError::Timeout)?
    .map_err(ConnectionError::Read)
    .and_then(|size| if size > 0 { Ok(size) } else { Err(ConnectionError::Dropped) })
}

async fn read_line(
    reader: impl AsyncBufReadExt + Unpin,
    buffer: &mut Vec<u8>,
) -> Result<usize, ConnectionError> {
    buffer.clear();

    let size = timeout(
        COMMAND_TIMEOUT,
        reader.take(MAX_LINE_LENGTH as u64 + 2).read_until(b'\n', buffer),
    )
    .await
    .map_err(|_| ConnectionError::Timeout)?
    .map_err(ConnectionError::Read)?;

    if size == 0 {
        return Err(ConnectionError::Dropped);
    }

    if !buffer.ends_with(b"\n") {
        return Err(ConnectionError::LineTooLong);
    }

    Ok(size)
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
