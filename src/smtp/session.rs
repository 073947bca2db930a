//! SMTP verb state machine (§4.E), grounded on the teacher's own
//! `SmtpSession`/`SessionReply`/`DataReply` shape (same file, prior
//! revision): AUTH is removed entirely (never advertised, never accepted),
//! STARTTLS becomes a real transition instead of an immediate `RESPONSE_ALREADY_TLS`,
//! and RCPT TO is gated on the recipient directory instead of a local table.

use std::{net::SocketAddr, sync::Arc};

use smtp_proto::{
    EhloResponse, EXT_8BIT_MIME, EXT_ENHANCED_STATUS_CODES, EXT_PIPELINING, EXT_SIZE,
    EXT_SMTP_UTF8, EXT_START_TLS, Request,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::{
    forwarder::{ForwardRequest, Forwarder},
    parser,
    recipients::Directory,
    validator::{CheckValues, Validator},
};

pub struct AcceptedRecipient {
    pub mask: String,
    pub forwarding_email: String,
    pub enabled: bool,
}

pub struct SmtpSession {
    validator: Arc<Validator>,
    directory: Arc<dyn Directory>,
    forwarder: Arc<dyn Forwarder>,
    hostname: String,
    tls_required: bool,
    /// Session-scoped cancellation (client disconnect, process shutdown),
    /// threaded into the validator's check fan-out (§5).
    cancel: CancellationToken,

    peer_addr: SocketAddr,
    peer_name: Option<String>,
    tls_active: bool,
    envelope_from: Option<String>,
    recipients: Vec<AcceptedRecipient>,
    data: Vec<u8>,
}

pub enum SessionReply {
    ReplyAndContinue(u16, String),
    ReplyAndStop(u16, String),
    RawReply(Vec<u8>),
    IngestData(u16, String),
    StartTls(u16, String),
}

pub enum DataReply {
    ReplyAndContinue(u16, String),
    ContinueIngest,
}

impl SmtpSession {
    const MAX_BODY_SIZE: usize = 25 * 1024 * 1024;

    const RESPONSE_OK: &str = "2.0.0 Ok";
    const RESPONSE_FROM_OK: &str = "2.1.0 Originator <[email]> ok";
    const RESPONSE_TO_OK: &str = "2.1.5 Recipient <[email]> ok";
    const RESPONSE_SYNTAX_ERROR: &str = "5.5.2 Syntax error";
    const RESPONSE_START_DATA: &str = "3.5.4 Start mail input; end with <CRLF>.<CRLF>";
    const RESPONSE_BYE: &str = "2.0.0 Goodbye";
    const RESPONSE_MESSAGE_ACCEPTED: &str = "2.6.0 Message queued for delivery";
    const RESPONSE_MESSAGE_REJECTED: &str = "5.6.0 Message rejected";
    const RESPONSE_MESSAGE_DEFERRED: &str = "4.3.0 Message forwarding temporarily failed";
    const RESPONSE_MESSAGE_MALFORMED: &str = "4.6.0 Could not parse message";
    const RESPONSE_BAD_SEQUENCE: &str = "5.5.1 Bad sequence of commands";
    const RESPONSE_MAIL_FIRST: &str = "5.5.1 Use MAIL first";
    const RESPONSE_HELLO_FIRST: &str = "5.5.1 Be nice and say EHLO first";
    const RESPONSE_INVALID_SENDER: &str = "5.1.7 This sender address is not valid";
    const RESPONSE_INVALID_EMAIL: &str = "5.1.3 This email address is not valid";
    const RESPONSE_NO_SUCH_USER: &str = "5.1.1 No such user";
    const RESPONSE_NESTED_MAIL: &str = "5.5.1 Error: nested MAIL command";
    const RESPONSE_AUTH_NOT_SUPPORTED: &str = "5.7.0 Authentication not supported";
    const RESPONSE_ALREADY_TLS: &str = "5.7.4 Already in TLS mode";
    const RESPONSE_TLS_REQUIRED: &str = "5.7.0 Must issue STARTTLS first";
    const RESPONSE_READY_FOR_TLS: &str = "2.0.0 Ready to start TLS";
    const RESPONSE_COMMAND_NOT_IMPLEMENTED: &str = "5.5.1 Command not implemented";
    const RESPONSE_MUST_USE_ESMTP: &str = "5.5.1 Must use EHLO";
    const RESPONSE_VRFY: &str = "2.1.5 Cannot VRFY user, but will accept message and attempt delivery";

    /// §6 "EHLO extensions advertised": SIZE argument, 25 MiB max body.
    const MAX_SIZE_ARGUMENT: usize = 26_214_400;

    #[allow(clippy::too_many_arguments)]
    pub fn new(
        peer_addr: SocketAddr,
        validator: Arc<Validator>,
        directory: Arc<dyn Directory>,
        forwarder: Arc<dyn Forwarder>,
        hostname: String,
        tls_required: bool,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            validator,
            directory,
            forwarder,
            hostname,
            tls_required,
            cancel,
            peer_addr,
            peer_name: None,
            tls_active: false,
            envelope_from: None,
            recipients: Vec::new(),
            data: Vec::new(),
        }
    }

    pub fn peer(&self) -> &SocketAddr {
        &self.peer_addr
    }

    /// Called by the connection driver right after a STARTTLS upgrade
    /// completes, resetting the session to GREETED-equivalent (RFC 3207).
    pub fn mark_tls_active(&mut self) {
        self.tls_active = true;
        self.peer_name = None;
        self.envelope_from = None;
        self.recipients.clear();
        self.data.clear();
    }

    pub async fn handle(&mut self, request: Result<Request<String>, smtp_proto::Error>) -> SessionReply {
        let request = match request {
            Ok(r) => r,
            Err(e) => {
                debug!("failed to parse request: {e}");
                return SessionReply::ReplyAndContinue(554, e.to_string());
            }
        };

        trace!("received request: {request:?} from {}", self.peer_addr);

        match request {
            Request::Ehlo { host } => {
                let mut response = EhloResponse::new(&host);
                response.capabilities = EXT_ENHANCED_STATUS_CODES
                    | EXT_8BIT_MIME
                    | EXT_SMTP_UTF8
                    | EXT_PIPELINING
                    | EXT_SIZE;
                response.size = Self::MAX_SIZE_ARGUMENT;
                if !self.tls_active {
                    response.capabilities |= EXT_START_TLS;
                }

                let mut buf = Vec::with_capacity(64);
                response.write(&mut buf).ok();

                self.peer_name = Some(host);

                SessionReply::RawReply(buf)
            }
            Request::Lhlo { .. } => {
                SessionReply::ReplyAndContinue(502, Self::RESPONSE_COMMAND_NOT_IMPLEMENTED.into())
            }
            Request::Helo { .. } => {
                SessionReply::ReplyAndContinue(502, Self::RESPONSE_MUST_USE_ESMTP.into())
            }
            Request::Auth { .. } => {
                SessionReply::ReplyAndContinue(502, Self::RESPONSE_AUTH_NOT_SUPPORTED.into())
            }
            Request::Quit => SessionReply::ReplyAndStop(221, Self::RESPONSE_BYE.into()),
            _ignored_command if self.peer_name.is_none() => {
                SessionReply::ReplyAndContinue(503, Self::RESPONSE_HELLO_FIRST.into())
            }
            Request::StartTls => {
                if self.tls_active {
                    return SessionReply::ReplyAndContinue(454, Self::RESPONSE_ALREADY_TLS.into());
                }
                SessionReply::StartTls(220, Self::RESPONSE_READY_FOR_TLS.into())
            }
            Request::Mail { from } => {
                debug!("received MAIL FROM: {}", from.address);

                if self.tls_required && !self.tls_active {
                    return SessionReply::ReplyAndContinue(530, Self::RESPONSE_TLS_REQUIRED.into());
                }

                if !from.address.is_empty() && from.address.parse::<email_address::EmailAddress>().is_err() {
                    return SessionReply::ReplyAndContinue(553, Self::RESPONSE_INVALID_SENDER.into());
                }

                if self.envelope_from.is_some() {
                    return SessionReply::ReplyAndContinue(503, Self::RESPONSE_NESTED_MAIL.into());
                }

                self.envelope_from = Some(from.address.clone());
                self.recipients.clear();
                self.data.clear();

                let response_message = Self::RESPONSE_FROM_OK.replace("[email]", &from.address);
                SessionReply::ReplyAndContinue(250, response_message)
            }
            Request::Rcpt { to } => {
                debug!("received RCPT TO: {}", to.address);

                if to.address.parse::<email_address::EmailAddress>().is_err() {
                    return SessionReply::ReplyAndContinue(553, Self::RESPONSE_INVALID_EMAIL.into());
                }

                if self.envelope_from.is_none() {
                    return SessionReply::ReplyAndContinue(503, Self::RESPONSE_MAIL_FIRST.into());
                }

                match self.directory.get_mask(&to.address).await {
                    Ok(record) => {
                        self.recipients.push(AcceptedRecipient {
                            mask: record.mask,
                            forwarding_email: record.forwarding_email,
                            enabled: record.enabled,
                        });
                        let response_message = Self::RESPONSE_TO_OK.replace("[email]", &to.address);
                        SessionReply::ReplyAndContinue(250, response_message)
                    }
                    Err(_) => {
                        SessionReply::ReplyAndContinue(550, Self::RESPONSE_NO_SUCH_USER.into())
                    }
                }
            }
            Request::Bdat { .. } => {
                SessionReply::ReplyAndContinue(502, Self::RESPONSE_COMMAND_NOT_IMPLEMENTED.into())
            }
            Request::Noop { .. } => SessionReply::ReplyAndContinue(250, Self::RESPONSE_OK.into()),
            Request::Data => {
                if self.envelope_from.is_none() {
                    return SessionReply::ReplyAndContinue(503, Self::RESPONSE_BAD_SEQUENCE.into());
                }

                // Zero recipients after DATA is a silent no-op (§8), not a
                // rejection: the transition itself is still accepted.
                SessionReply::IngestData(354, Self::RESPONSE_START_DATA.into())
            }
            Request::Rset => {
                self.envelope_from = None;
                self.recipients.clear();
                self.data.clear();
                SessionReply::ReplyAndContinue(250, Self::RESPONSE_OK.into())
            }
            Request::Vrfy { .. } => SessionReply::ReplyAndContinue(252, Self::RESPONSE_VRFY.into()),
            Request::Expn { .. } | Request::Help { .. } => {
                SessionReply::ReplyAndContinue(502, Self::RESPONSE_COMMAND_NOT_IMPLEMENTED.into())
            }
            Request::Etrn { .. } | Request::Atrn { .. } | Request::Burl { .. } => {
                SessionReply::ReplyAndContinue(502, Self::RESPONSE_COMMAND_NOT_IMPLEMENTED.into())
            }
        }
    }

    pub async fn handle_data(&mut self, chunk: &[u8]) -> DataReply {
        if self.envelope_from.is_none() {
            return DataReply::ReplyAndContinue(503, Self::RESPONSE_BAD_SEQUENCE.into());
        }

        self.data.extend_from_slice(chunk);

        if self.data.len() > Self::MAX_BODY_SIZE {
            debug!("failed to read message: message too big");
            self.data.clear();
            return DataReply::ReplyAndContinue(552, Self::RESPONSE_MESSAGE_REJECTED.into());
        }

        const DATA_END: &[u8] = b"\r\n.\r\n";

        if !(self.data.ends_with(DATA_END) || self.data == DATA_END[2..]) {
            return DataReply::ContinueIngest;
        }

        self.data.truncate(self.data.len() - DATA_END.len());

        let envelope_from = self.envelope_from.take().unwrap_or_default();
        let recipients = std::mem::take(&mut self.recipients);
        let data = std::mem::take(&mut self.data);

        trace!("received message ({} bytes)", data.len());

        self.process_message(envelope_from, recipients, data).await
    }

    async fn process_message(
        &self,
        envelope_from: String,
        recipients: Vec<AcceptedRecipient>,
        data: Vec<u8>,
    ) -> DataReply {
        let parsed = match parser::parse(&data) {
            Ok(parsed) => parsed,
            Err(_) => {
                return DataReply::ReplyAndContinue(451, Self::RESPONSE_MESSAGE_MALFORMED.into());
            }
        };

        let header_from = parsed.header_from().unwrap_or(&envelope_from).to_string();
        let helo = self.peer_name.clone().unwrap_or_default();
        let data: Arc<[u8]> = data.into();

        let verdict = self
            .validator
            .run_checks(
                CheckValues {
                    envelope_from: envelope_from.clone(),
                    header_from,
                    helo,
                    data,
                    peer_ip: self.peer_addr.ip(),
                },
                self.cancel.clone(),
            )
            .await;

        if verdict.reject {
            info!(reason = ?verdict.reason, "rejecting message");
            let reason = verdict.reason.unwrap_or_default().replace(['\r', '\n'], " ");
            return DataReply::ReplyAndContinue(550, reason);
        }

        // A disabled mask is silently discarded, same as a mask nobody ever
        // RCPT'd to (§8): no counters, no forward POST, just a plain success.
        let recipients: Vec<_> = recipients.into_iter().filter(|r| r.enabled).collect();
        if recipients.is_empty() {
            return DataReply::ReplyAndContinue(250, Self::RESPONSE_MESSAGE_ACCEPTED.into());
        }

        for recipient in &recipients {
            self.directory.increment_received_count(&recipient.mask).await;
        }

        let subject = if verdict.quarantine {
            format!("[SPAM] {}", parsed.subject.unwrap_or_default())
        } else {
            parsed.subject.unwrap_or_default()
        };

        let (from_address, from_name) = if recipients.len() == 1 {
            (recipients[0].forwarding_email.clone(), String::new())
        } else {
            (format!("no-reply@{}", self.hostname), String::new())
        };

        let request = ForwardRequest {
            from_address,
            from_name,
            to: recipients
                .iter()
                .map(|r| r.forwarding_email.clone())
                .collect(),
            subject,
            html_body: parsed.html_body,
            text_body: parsed.text_body,
        };

        match self.forwarder.forward(&request).await {
            Ok(()) => {
                for recipient in &recipients {
                    self.directory.increment_forwarded_count(&recipient.mask).await;
                }
                DataReply::ReplyAndContinue(250, Self::RESPONSE_MESSAGE_ACCEPTED.into())
            }
            Err(e) => {
                debug!(error = %e, "forwarding failed");
                DataReply::ReplyAndContinue(451, Self::RESPONSE_MESSAGE_DEFERRED.into())
            }
        }
    }
}
