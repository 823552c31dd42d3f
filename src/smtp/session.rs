use std::net::SocketAddr;

use smtp_proto::{
    EXT_8BIT_MIME, EXT_ENHANCED_STATUS_CODES, EXT_SMTP_UTF8, EXT_START_TLS, EhloResponse, Request,
};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::{
    address,
    auth,
    envelope::{Envelope, dedup_by_target},
    error::RelayError,
    mime,
    smtp::RelayServices,
};

pub struct SmtpSession {
    services: RelayServices,
    peer_addr: SocketAddr,
    peer_name: Option<String>,
    session_id: Uuid,
    envelope: Option<Envelope>,
    /// Headers extracted the moment the header/body separator shows up in
    /// `data_buffer`, so a DATA phase never has to wait for the whole
    /// message before it knows what it's carrying (spec.md §5).
    pending_headers: Option<mime::ParsedHeaders>,
    data_buffer: Vec<u8>,
    tls_active: bool,
    tls_available: bool,
}

pub enum SessionReply {
    ReplyAndContinue(u16, String),
    ReplyAndStop(u16, String),
    RawReply(Vec<u8>),
    IngestData(u16, String),
    /// Reply, then have the connection loop perform an in-place STARTTLS
    /// upgrade of the underlying stream (spec.md §6: "Advertises STARTTLS").
    StartTls(u16, String),
}

pub enum DataReply {
    ReplyAndContinue(u16, String),
    ContinueIngest,
}

impl SmtpSession {
    const RESPONSE_OK: &str = "2.0.0 Ok";
    const RESPONSE_FROM_OK: &str = "2.1.0 Originator <[email]> ok";
    const RESPONSE_TO_OK: &str = "2.1.5 Recipient <[email]> ok";
    const RESPONSE_START_DATA: &str = "3.5.4 Start mail input; end with <CRLF>.<CRLF>";
    const RESPONSE_BYE: &str = "2.0.0 Goodbye";
    const RESPONSE_MESSAGE_RELAYED: &str = "2.6.0 Message relayed";
    const RESPONSE_BAD_SEQUENCE: &str = "5.5.1 Bad sequence of commands";
    const RESPONSE_MAIL_FIRST: &str = "5.5.1 Use MAIL first";
    const RESPONSE_HELLO_FIRST: &str = "5.5.1 Be nice and say EHLO first";
    const RESPONSE_NOVALID_RECIPIENTS: &str = "5.5.1 No valid recipients";
    const RESPONSE_INVALID_SENDER: &str = "5.1.7 This sender address is not valid";
    const RESPONSE_INVALID_EMAIL: &str = "5.1.3 This email address is not valid";
    const RESPONSE_NESTED_MAIL: &str = "5.5.1 Error: nested MAIL command";
    const RESPONSE_COMMAND_NOT_IMPLEMENTED: &str = "5.5.1 Command not implemented";
    const RESPONSE_MUST_USE_ESMTP: &str = "5.5.1 Must use EHLO";
    const RESPONSE_NO_VRFY: &str = "5.5.1 VRFY command is disabled";
    const RESPONSE_TLS_GO_AHEAD: &str = "2.0.0 Ready to start TLS";
    const RESPONSE_TLS_ALREADY_ACTIVE: &str = "5.5.1 TLS already active";
    const RESPONSE_TLS_NOT_AVAILABLE: &str = "5.5.1 TLS not available";

    pub fn new(peer_addr: SocketAddr, services: RelayServices, tls_available: bool) -> Self {
        Self {
            services,
            peer_addr,
            peer_name: None,
            session_id: Uuid::new_v4(),
            envelope: None,
            pending_headers: None,
            data_buffer: Vec::new(),
            tls_active: false,
            tls_available,
        }
    }

    pub fn peer(&self) -> &SocketAddr {
        &self.peer_addr
    }

    /// Called by the connection loop right after a successful STARTTLS
    /// handshake, so the next EHLO stops advertising the capability and a
    /// second STARTTLS is rejected.
    pub fn mark_tls_active(&mut self) {
        self.tls_active = true;
    }

    fn reset_transaction(&mut self) {
        self.envelope = None;
        self.pending_headers = None;
        self.data_buffer.clear();
    }

    pub async fn handle(
        &mut self,
        request: Result<Request<String>, smtp_proto::Error>,
    ) -> SessionReply {
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
                // spec.md §4.I CONNECT admission: the client-announced
                // hostname must be a FQDN or the session never proceeds.
                if !address::is_fqdn(&host) {
                    let (code, message) =
                        RelayError::BadClientHostname(format!("{host} does not resolve to a FQDN"))
                            .reply();
                    return SessionReply::ReplyAndContinue(code, message.into_owned());
                }

                let mut response = EhloResponse::new(&host);
                response.capabilities = EXT_ENHANCED_STATUS_CODES | EXT_8BIT_MIME | EXT_SMTP_UTF8;
                if self.tls_available && !self.tls_active {
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
            Request::Quit => SessionReply::ReplyAndStop(221, Self::RESPONSE_BYE.into()),
            _ignored_command if self.peer_name.is_none() => {
                SessionReply::ReplyAndContinue(503, Self::RESPONSE_HELLO_FIRST.into())
            }
            Request::Mail { from } => self.handle_mail_from(from.address).await,
            Request::Rcpt { to } => self.handle_rcpt_to(to.address).await,
            Request::Bdat { .. } => {
                SessionReply::ReplyAndContinue(502, Self::RESPONSE_COMMAND_NOT_IMPLEMENTED.into())
            }
            Request::Noop { .. } => SessionReply::ReplyAndContinue(250, Self::RESPONSE_OK.into()),
            Request::StartTls => {
                if self.tls_active {
                    SessionReply::ReplyAndContinue(503, Self::RESPONSE_TLS_ALREADY_ACTIVE.into())
                } else if !self.tls_available {
                    SessionReply::ReplyAndContinue(454, Self::RESPONSE_TLS_NOT_AVAILABLE.into())
                } else {
                    SessionReply::StartTls(220, Self::RESPONSE_TLS_GO_AHEAD.into())
                }
            }
            Request::Data => {
                let Some(envelope) = &self.envelope else {
                    return SessionReply::ReplyAndContinue(503, Self::RESPONSE_BAD_SEQUENCE.into());
                };
                if envelope.recipients.is_empty() {
                    return SessionReply::ReplyAndContinue(
                        554,
                        Self::RESPONSE_NOVALID_RECIPIENTS.into(),
                    );
                }
                self.data_buffer.clear();
                self.pending_headers = None;
                SessionReply::IngestData(354, Self::RESPONSE_START_DATA.into())
            }
            Request::Rset => {
                self.reset_transaction();
                SessionReply::ReplyAndContinue(250, Self::RESPONSE_OK.into())
            }
            Request::Vrfy { .. } => {
                SessionReply::ReplyAndContinue(502, Self::RESPONSE_NO_VRFY.into())
            }
            Request::Expn { .. } | Request::Help { .. } => {
                SessionReply::ReplyAndContinue(502, Self::RESPONSE_COMMAND_NOT_IMPLEMENTED.into())
            }
            Request::Etrn { .. } | Request::Atrn { .. } | Request::Burl { .. } | Request::Auth { .. } => {
                SessionReply::ReplyAndContinue(502, Self::RESPONSE_COMMAND_NOT_IMPLEMENTED.into())
            }
        }
    }

    async fn handle_mail_from(&mut self, from_address: String) -> SessionReply {
        debug!("received MAIL FROM: {from_address}");

        if !address::is_valid_email(&from_address) {
            return SessionReply::ReplyAndContinue(553, Self::RESPONSE_INVALID_SENDER.into());
        }

        if self.envelope.is_some() {
            return SessionReply::ReplyAndContinue(503, Self::RESPONSE_NESTED_MAIL.into());
        }

        // spec.md §4.A/§4.I: the sender's own domain is ours to police —
        // must be a FQDN and must not be on the disposable-domain deny-list.
        let domain = match address::parse_domain(&from_address, &self.services.disposable) {
            Ok(domain) => domain,
            Err(err) => {
                let (code, message) = err.reply();
                return SessionReply::ReplyAndContinue(code, message.into_owned());
            }
        };

        let status = self.services.rate_limiter.get(&from_address).await;
        if status.is_exceeded() {
            let err = RelayError::RateLimited(status.retry_hint(chrono::Utc::now()));
            let (code, message) = err.reply();
            return SessionReply::ReplyAndContinue(code, message.into_owned());
        }

        // spec.md §4.I: sender-domain MX existence check.
        if let Err(err) = self.services.dns.resolve_mx(domain).await {
            let (code, message) = err.reply();
            return SessionReply::ReplyAndContinue(code, message.into_owned());
        }

        let mut envelope = Envelope::new(
            self.session_id,
            self.peer_addr.ip(),
            self.peer_name.clone().unwrap_or_default(),
        );
        envelope.mail_from = from_address.clone();
        self.envelope = Some(envelope);

        let response_message = Self::RESPONSE_FROM_OK.replace("[email]", &from_address);
        SessionReply::ReplyAndContinue(250, response_message)
    }

    async fn handle_rcpt_to(&mut self, to_address: String) -> SessionReply {
        debug!("received RCPT TO: {to_address}");

        if !address::is_valid_email(&to_address) {
            return SessionReply::ReplyAndContinue(553, Self::RESPONSE_INVALID_EMAIL.into());
        }

        let Some(envelope) = &mut self.envelope else {
            return SessionReply::ReplyAndContinue(503, Self::RESPONSE_MAIL_FIRST.into());
        };

        if !envelope.add_recipient(to_address.clone()) {
            let response_message = Self::RESPONSE_TO_OK.replace("[email]", &to_address);
            return SessionReply::ReplyAndContinue(250, response_message);
        }

        let forwarded_to = match self
            .services
            .forwarding
            .resolve(&to_address, &self.services.disposable, &self.services.config.exchanges)
            .await
        {
            Ok(target) => target,
            Err(err) => {
                // the recipient was already recorded by `add_recipient` above
                // so a retry of the same RCPT TO still short-circuits to the
                // cached outcome rather than re-querying DNS; reverse that
                // here since this attempt failed outright.
                self.envelope
                    .as_mut()
                    .expect("just matched Some above")
                    .recipients
                    .retain(|r| r != &to_address);
                let (code, message) = err.reply();
                return SessionReply::ReplyAndContinue(code, message.into_owned());
            }
        };

        self.envelope
            .as_mut()
            .expect("just matched Some above")
            .resolved
            .push(crate::envelope::ResolvedRecipient {
                original: to_address.clone(),
                forwarded_to,
            });

        let response_message = Self::RESPONSE_TO_OK.replace("[email]", &to_address);
        SessionReply::ReplyAndContinue(250, response_message)
    }

    pub async fn handle_data(&mut self, chunk: &[u8]) -> DataReply {
        self.data_buffer.extend_from_slice(chunk);

        if self.data_buffer.len() as u64 > self.services.config.max_message_size_bytes {
            debug!("rejecting message: exceeds configured size limit");
            self.reset_transaction();
            let (code, message) = RelayError::MessageTooLarge.reply();
            return DataReply::ReplyAndContinue(code, message.into_owned());
        }

        // spec.md §5: extract headers as soon as they're fully arrived,
        // without waiting for the rest of the (possibly still-streaming)
        // body.
        if self.pending_headers.is_none()
            && self.data_buffer.windows(4).any(|w| w == b"\r\n\r\n")
        {
            let headers = mime::scan_headers(&self.data_buffer);
            trace!(subject = ?headers.subject, "extracted headers mid-stream");
            self.pending_headers = Some(headers);
        }

        const DATA_END: &[u8] = b"\r\n.\r\n";
        if !(self.data_buffer.ends_with(DATA_END) || self.data_buffer == DATA_END[2..]) {
            return DataReply::ContinueIngest;
        }

        self.data_buffer
            .truncate(self.data_buffer.len().saturating_sub(DATA_END.len()));

        let (code, message) = self.finish_message().await;
        self.reset_transaction();
        DataReply::ReplyAndContinue(code, message)
    }

    async fn finish_message(&mut self) -> (u16, String) {
        let Some(envelope) = self.envelope.take() else {
            return (503, Self::RESPONSE_BAD_SEQUENCE.into());
        };

        let mail_from_domain = address::split_domain(&envelope.mail_from).unwrap_or("");

        let spf = self
            .services
            .spf
            .verify(self.peer_addr.ip(), &envelope.helo, mail_from_domain)
            .await;
        let dkim = self.services.dkim_verifier.verify(&self.data_buffer).await;

        if let Err(err) = auth::accept(spf, dkim) {
            info!(
                mail_from = envelope.mail_from,
                "rejecting message: provenance check failed"
            );
            let (code, message) = err.reply();
            return (code, message.into_owned());
        }

        let prepared = mime::prepare_for_relay(&self.data_buffer, &self.services.config.server_name);

        let signed = match &self.services.dkim_signer {
            Some(signer) => {
                let parsed = mime::parse(&prepared);
                match signer.sign_header(&parsed) {
                    Ok(header) => {
                        let mut out = header.into_bytes();
                        out.extend_from_slice(&prepared);
                        out
                    }
                    Err(err) => {
                        warn!("failed to sign outbound message: {err}");
                        prepared
                    }
                }
            }
            None => prepared,
        };

        let targets = dedup_by_target(envelope.resolved);
        let recipients: Vec<String> = targets.iter().map(|r| r.forwarded_to.clone()).collect();

        let outcomes = self
            .services
            .delivery
            .deliver_all(&envelope.mail_from, &recipients, &signed)
            .await;

        match crate::delivery::worst_reply(&outcomes) {
            Some((code, message)) => (code, message),
            None => (250, Self::RESPONSE_MESSAGE_RELAYED.to_string()),
        }
    }
}

#[cfg(test)]
mod test {
    use std::{net::SocketAddr, path::PathBuf, sync::Arc};

    use tracing_test::traced_test;

    use super::*;
    use crate::{
        auth::{
            dkim::{DkimOutcome, DkimVerifier},
            spf::{SpfOutcome, SpfVerifier},
        },
        config::{Environment, RelayConfig},
        delivery::DeliveryClient,
        disposable::DisposableDomains,
        dns::DnsResolver,
        forwarding::ForwardingResolver,
        ratelimit::RateLimiter,
    };

    fn test_config() -> RelayConfig {
        RelayConfig {
            max_message_size_bytes: 25 * 1024 * 1024,
            rate_limit: crate::config::RateLimitConfig { max: 100, window_ms: 3_600_000 },
            exchanges: vec!["mx1.forwardemail.net".to_string(), "mx2.forwardemail.net".to_string()],
            listen_addr: "0.0.0.0:25".to_string(),
            server_name: "relay.test".to_string(),
            environment: Environment::Test,
            tls: Default::default(),
            dkim: Default::default(),
            disposable_domains_file: None,
        }
    }

    fn peer() -> SocketAddr {
        "203.0.113.10:53124".parse().unwrap()
    }

    /// Build a fully wired `RelayServices` with a DNS resolver that only
    /// knows about `niftylettuce.com` (MAIL FROM domain) forwarding to
    /// whatever `mailcrab` catcher is listening on `delivery_port`, and
    /// SPF/DKIM forced to `spf`/`dkim`.
    fn services_with(delivery_port: u16, spf: SpfOutcome, dkim: DkimOutcome) -> RelayServices {
        let dns = DnsResolver::mock()
            .with_mx("niftylettuce.com", &[("mx1.forwardemail.net", 10), ("mx2.forwardemail.net", 20)])
            .with_txt("niftylettuce.com", &["forward-email=hello@gmail.com"])
            .with_mx_port("gmail.com", "localhost", 10, delivery_port)
            .build();

        let disposable = Arc::new(DisposableDomains::load(None));
        let config = Arc::new(test_config());

        RelayServices {
            config: config.clone(),
            disposable: disposable.clone(),
            rate_limiter: RateLimiter::new(100, std::time::Duration::from_secs(3600)),
            forwarding: Arc::new(ForwardingResolver::new(dns.clone())),
            spf: Arc::new(SpfVerifier::mock(spf)),
            dkim_verifier: Arc::new(DkimVerifier::mock(dkim)),
            dkim_signer: None,
            delivery: Arc::new(DeliveryClient::new(dns.clone(), "relay.test".to_string(), Environment::Test)),
            dns,
        }
    }

    fn session_with(services: RelayServices) -> SmtpSession {
        SmtpSession::new(peer(), services, false)
    }

    async fn ehlo(session: &mut SmtpSession) {
        let reply = session
            .handle(Ok(Request::Ehlo { host: "mail.example.com".to_string() }))
            .await;
        assert!(matches!(reply, SessionReply::RawReply(_)));
    }

    #[tokio::test]
    async fn mail_from_disposable_domain_is_rejected() {
        let services = services_with(0, SpfOutcome::Pass, DkimOutcome::None);
        let mut session = session_with(services);
        ehlo(&mut session).await;

        let reply = session.handle_mail_from("hello@mailinator.com".to_string()).await;
        match reply {
            SessionReply::ReplyAndContinue(code, _) => assert_eq!(code, 550),
            _ => panic!("expected a rejection"),
        }
        assert!(session.envelope.is_none());
    }

    #[tokio::test]
    async fn rcpt_before_mail_from_is_rejected() {
        let services = services_with(0, SpfOutcome::Pass, DkimOutcome::None);
        let mut session = session_with(services);
        ehlo(&mut session).await;

        let reply = session.handle_rcpt_to("someone@niftylettuce.com".to_string()).await;
        match reply {
            SessionReply::ReplyAndContinue(code, message) => {
                assert_eq!(code, 503);
                assert!(message.contains("MAIL first"));
            }
            _ => panic!("expected rejection"),
        }
    }

    #[tokio::test]
    async fn mail_from_then_rcpt_to_resolves_forwarding_target() {
        let services = services_with(0, SpfOutcome::Pass, DkimOutcome::None);
        let mut session = session_with(services);
        ehlo(&mut session).await;

        let mail_reply = session.handle_mail_from("sender@niftylettuce.com".to_string()).await;
        assert!(matches!(mail_reply, SessionReply::ReplyAndContinue(250, _)));

        let rcpt_reply = session.handle_rcpt_to("hello@niftylettuce.com".to_string()).await;
        assert!(matches!(rcpt_reply, SessionReply::ReplyAndContinue(250, _)));

        let envelope = session.envelope.as_ref().unwrap();
        assert_eq!(envelope.recipients, vec!["hello@niftylettuce.com".to_string()]);
        assert_eq!(envelope.resolved[0].forwarded_to, "hello@gmail.com");
    }

    #[tokio::test]
    async fn duplicate_rcpt_to_is_accepted_without_reresolving() {
        let services = services_with(0, SpfOutcome::Pass, DkimOutcome::None);
        let mut session = session_with(services);
        ehlo(&mut session).await;
        session.handle_mail_from("sender@niftylettuce.com".to_string()).await;

        session.handle_rcpt_to("hello@niftylettuce.com".to_string()).await;
        let second = session.handle_rcpt_to("hello@niftylettuce.com".to_string()).await;

        assert!(matches!(second, SessionReply::ReplyAndContinue(250, _)));
        assert_eq!(session.envelope.as_ref().unwrap().resolved.len(), 1);
    }

    #[tokio::test]
    async fn data_before_rcpt_to_is_rejected() {
        let services = services_with(0, SpfOutcome::Pass, DkimOutcome::None);
        let mut session = session_with(services);
        ehlo(&mut session).await;
        session.handle_mail_from("sender@niftylettuce.com".to_string()).await;

        let reply = session.handle(Ok(Request::Data)).await;
        match reply {
            SessionReply::ReplyAndContinue(code, _) => assert_eq!(code, 554),
            _ => panic!("expected rejection, no recipients resolved yet"),
        }
    }

    #[tokio::test]
    async fn headers_are_extracted_before_the_terminator_arrives() {
        let services = services_with(0, SpfOutcome::Pass, DkimOutcome::None);
        let mut session = session_with(services);
        ehlo(&mut session).await;
        session.handle_mail_from("sender@niftylettuce.com".to_string()).await;
        session.handle_rcpt_to("hello@niftylettuce.com".to_string()).await;
        session.handle(Ok(Request::Data)).await;

        let reply = session
            .handle_data(b"Subject: streaming works\r\nFrom: sender@niftylettuce.com\r\n\r\nstill writing the body")
            .await;

        assert!(matches!(reply, DataReply::ContinueIngest));
        let headers = session.pending_headers.as_ref().expect("headers extracted mid-stream");
        assert_eq!(headers.subject.as_deref(), Some("streaming works"));
    }

    #[tokio::test]
    #[traced_test]
    async fn full_transaction_delivers_via_mailcrab() {
        let port = rand::random_range(10_000..30_000);
        let mailcrab::TestMailServerHandle { token, mut rx } =
            mailcrab::development_mail_server(std::net::Ipv4Addr::new(127, 0, 0, 1), port).await;
        let _drop_guard = token.drop_guard();

        let services = services_with(port, SpfOutcome::Pass, DkimOutcome::Pass);
        let mut session = session_with(services);
        ehlo(&mut session).await;
        session.handle_mail_from("sender@niftylettuce.com".to_string()).await;
        session.handle_rcpt_to("hello@niftylettuce.com".to_string()).await;
        session.handle(Ok(Request::Data)).await;

        let body = b"From: sender@niftylettuce.com\r\nTo: hello@niftylettuce.com\r\nSubject: hi\r\n\r\nhello\r\n.\r\n";
        let reply = session.handle_data(body).await;

        match reply {
            DataReply::ReplyAndContinue(code, _) => assert_eq!(code, 250),
            DataReply::ContinueIngest => panic!("message should have completed"),
        }

        let received = rx.recv().await.unwrap();
        assert_eq!(received.envelope_from.as_str(), "sender@niftylettuce.com");
        assert_eq!(received.envelope_recipients[0].as_str(), "hello@gmail.com");
    }

    #[tokio::test]
    async fn provenance_failure_is_reported_and_resets_transaction() {
        let services = services_with(0, SpfOutcome::Fail, DkimOutcome::Fail);
        let mut session = session_with(services);
        ehlo(&mut session).await;
        session.handle_mail_from("sender@niftylettuce.com".to_string()).await;
        session.handle_rcpt_to("hello@niftylettuce.com".to_string()).await;
        session.handle(Ok(Request::Data)).await;

        let body = b"From: sender@niftylettuce.com\r\nTo: hello@niftylettuce.com\r\n\r\nhello\r\n.\r\n";
        let reply = session.handle_data(body).await;

        match reply {
            DataReply::ReplyAndContinue(code, _) => assert_eq!(code, 550),
            DataReply::ContinueIngest => panic!("message should have completed"),
        }
        assert!(session.envelope.is_none());
    }
}
