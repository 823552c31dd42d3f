//! Outbound delivery (spec.md §4.H): dial every resolved recipient's MX set
//! in priority order, preferring opportunistic TLS, and classify failures as
//! temporary or permanent.
//!
//! Grounded directly on the teacher's `handler/mod.rs::send_single_message` /
//! `send_single_upstream` (including its `mail_send::Error` → temporary/
//! permanent match), generalized from "the sender has one outbound IP
//! pinned by Kubernetes" to "connect from whatever local address the OS
//! picks" and from "reattempt later via the message bus" to "all recipients
//! are dialed concurrently in one pass, worst reply wins" (spec.md §9).

use std::time::Duration;

use mail_send::{SmtpClient, SmtpClientBuilder, smtp};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, trace, warn};

use crate::{config::Environment, dns::DnsResolver, error::RelayError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Protection {
    Tls,
    Plaintext,
}

#[derive(Debug)]
pub struct DeliveryOutcome {
    pub recipient: String,
    pub result: Result<(), RelayError>,
}

pub struct DeliveryClient {
    dns: DnsResolver,
    helo_domain: String,
    environment: Environment,
}

impl DeliveryClient {
    pub fn new(dns: DnsResolver, helo_domain: String, environment: Environment) -> Self {
        Self {
            dns,
            helo_domain,
            environment,
        }
    }

    /// Deliver one message to every recipient concurrently, returning one
    /// outcome per recipient in the same order they were given.
    pub async fn deliver_all(
        &self,
        mail_from: &str,
        recipients: &[String],
        raw_message: &[u8],
    ) -> Vec<DeliveryOutcome> {
        let deliveries = recipients.iter().map(|recipient| {
            self.deliver_one(mail_from, recipient, raw_message)
        });
        futures::future::join_all(deliveries).await
    }

    async fn deliver_one(
        &self,
        mail_from: &str,
        recipient: &str,
        raw_message: &[u8],
    ) -> DeliveryOutcome {
        let result = self.deliver_one_inner(mail_from, recipient, raw_message).await;
        DeliveryOutcome {
            recipient: recipient.to_string(),
            result,
        }
    }

    async fn deliver_one_inner(
        &self,
        mail_from: &str,
        recipient: &str,
        raw_message: &[u8],
    ) -> Result<(), RelayError> {
        let domain = crate::address::split_domain(recipient)
            .ok_or_else(|| RelayError::InvalidDomain(format!("{recipient} has no domain")))?;

        let exchanges = self.dns.resolve_mx(domain).await?;

        let message = smtp::message::Message {
            mail_from: mail_from.into(),
            rcpt_to: vec![recipient.into()],
            body: raw_message.into(),
        };

        let order: &[Protection] = if self.environment.allows_insecure_tls() {
            &[Protection::Tls, Protection::Plaintext]
        } else {
            &[Protection::Tls]
        };

        let mut last_temporary = true;

        for exchange in &exchanges {
            for &protection in order {
                match self
                    .try_upstream(&exchange.exchange, exchange.port, protection, message.clone())
                    .await
                {
                    Ok(()) => return Ok(()),
                    Err((temporary, err)) => {
                        last_temporary = temporary;
                        debug!(
                            recipient,
                            exchange = exchange.exchange.as_str(),
                            "delivery attempt failed: {err}"
                        );
                    }
                }
            }
        }

        if last_temporary {
            Err(RelayError::TransientDns(format!(
                "no upstream server for {domain} accepted the message"
            )))
        } else {
            Err(RelayError::DownstreamSmtp {
                code: 550,
                message: format!("all upstream servers for {domain} rejected the message"),
            })
        }
    }

    async fn try_upstream(
        &self,
        hostname: &str,
        port: u16,
        protection: Protection,
        message: smtp::message::Message<'_>,
    ) -> Result<(), (bool, mail_send::Error)> {
        let mut builder = SmtpClientBuilder::new(hostname, port)
            .implicit_tls(false)
            .say_ehlo(true)
            .helo_host(&self.helo_domain)
            .timeout(Duration::from_secs(60));

        if self.environment.allows_insecure_tls() {
            builder = builder.allow_invalid_certs();
        }

        let result = match protection {
            Protection::Tls => match builder.connect().await {
                Err(err) => Err(err),
                Ok(mut client) => {
                    trace!(hostname, port, "connected to upstream over TLS");
                    let result = client.send(message).await;
                    quit(client, hostname).await;
                    result
                }
            },
            Protection::Plaintext => match builder.connect_plain().await {
                Err(err) => Err(err),
                Ok(mut client) => {
                    trace!(hostname, port, "connected to upstream in plaintext");
                    let result = client.send(message).await;
                    quit(client, hostname).await;
                    result
                }
            },
        };

        result.map_err(|err| {
            info!(hostname, port, "could not use server: {err}");
            (is_temporary(&err), err)
        })
    }
}

async fn quit<T>(client: SmtpClient<T>, hostname: &str)
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    client
        .quit()
        .await
        .inspect_err(|err| warn!("failed to close upstream connection with {hostname}: {err}"))
        .ok();
}

fn is_temporary(err: &mail_send::Error) -> bool {
    match err {
        mail_send::Error::Io(_)
        | mail_send::Error::Tls(_)
        | mail_send::Error::Base64(_)
        | mail_send::Error::Auth(_)
        | mail_send::Error::UnparseableReply
        | mail_send::Error::InvalidTLSName
        | mail_send::Error::Timeout => true,
        mail_send::Error::UnexpectedReply(response)
        | mail_send::Error::AuthenticationFailed(response) => {
            response.severity() == smtp_proto::Severity::TransientNegativeCompletion
        }
        mail_send::Error::MissingCredentials
        | mail_send::Error::MissingMailFrom
        | mail_send::Error::MissingRcptTo
        | mail_send::Error::UnsupportedAuthMechanism
        | mail_send::Error::MissingStartTls => false,
    }
}

/// Aggregate a set of per-recipient outcomes into the single worst SMTP
/// reply to send back on the original inbound connection (spec.md §9: 5xx
/// outranks 4xx, and any success alongside failures still requires
/// per-recipient DSN semantics that the caller handles by inspecting
/// `DeliveryOutcome` individually; this just picks the headline reply).
pub fn worst_reply(outcomes: &[DeliveryOutcome]) -> Option<(u16, String)> {
    outcomes
        .iter()
        .filter_map(|o| o.result.as_ref().err())
        .map(|e| e.reply())
        .max_by_key(|(code, _)| *code)
        .map(|(code, message)| (code, message.into_owned()))
}
