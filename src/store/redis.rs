//! Redis-backed coordination store.
//!
//! Each trait operation maps to exactly one Lua script invocation through
//! the connection manager, so every admission step is a single atomic
//! round trip shared by all participating processes. Keys live under
//! `namespace` (prefix + resource name), keeping resources isolated from
//! one another.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

use crate::connection::RedisConnectionManager;
use crate::error::RateLimitError;
use crate::models::{Dimension, RecordId};
use crate::scripts::Scripts;
use crate::window::RECORD_TTL_SECS;

use super::{AdmitOutcome, AdmitRequest, CoordinationStore, Ticket};

pub struct RedisStore {
    manager: RedisConnectionManager,
    namespace: String,
    scripts: Scripts,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore").field("namespace", &self.namespace).finish()
    }
}

impl RedisStore {
    /// Store for one resource namespace (key prefix + resource name).
    pub fn new(manager: RedisConnectionManager, namespace: impl Into<String>) -> Self {
        Self { manager, namespace: namespace.into(), scripts: Scripts::new() }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }
}

fn lease_millis(lease: Duration) -> String {
    lease.as_millis().to_string()
}

#[async_trait]
impl CoordinationStore for RedisStore {
    async fn enqueue(&self, lease: Duration) -> Result<Ticket, RateLimitError> {
        let args = vec![self.namespace.clone(), lease_millis(lease)];
        let ticket: u64 = self.manager.invoke(&self.scripts.enqueue, &args).await?;
        Ok(Ticket(ticket))
    }

    async fn try_admit(
        &self,
        ticket: Ticket,
        lease: Duration,
        request: &AdmitRequest,
    ) -> Result<AdmitOutcome, RateLimitError> {
        let (record_id, reserved_output) = match &request.reservation {
            Some(reservation) => {
                (reservation.record_id.to_string(), reservation.reserved_output.to_string())
            }
            None => (String::new(), "0".to_string()),
        };

        let mut args = vec![
            self.namespace.clone(),
            ticket.0.to_string(),
            lease_millis(lease),
            record_id,
            RECORD_TTL_SECS.to_string(),
            reserved_output,
            request.charges.len().to_string(),
        ];
        for charge in &request.charges {
            args.push(charge.dimension.tag().to_string());
            args.push(charge.ceiling.to_string());
            args.push(charge.cost.to_string());
        }

        let reply: Vec<String> = self.manager.invoke(&self.scripts.try_admit, &args).await?;
        match reply.first().map(String::as_str) {
            Some("OK") => Ok(AdmitOutcome::Admitted),
            Some("WAIT_TURN") => Ok(AdmitOutcome::WaitTurn),
            Some("WAIT_CAPACITY") => {
                let tag = reply.get(1).map(String::as_str).unwrap_or_default();
                let dimension = Dimension::from_tag(tag).ok_or_else(|| {
                    RateLimitError::protocol(format!("unknown dimension tag {:?}", tag))
                })?;
                Ok(AdmitOutcome::WaitCapacity { dimension })
            }
            Some("EXPIRED") => Ok(AdmitOutcome::TicketExpired),
            other => Err(RateLimitError::protocol(format!("admit reply {:?}", other))),
        }
    }

    async fn withdraw(&self, ticket: Ticket) -> Result<bool, RateLimitError> {
        let args = vec![self.namespace.clone(), ticket.0.to_string()];
        let removed: i64 = self.manager.invoke(&self.scripts.withdraw, &args).await?;
        Ok(removed > 0)
    }

    async fn adjust(
        &self,
        record_id: &RecordId,
        actual_output: u64,
    ) -> Result<i64, RateLimitError> {
        let args = vec![
            self.namespace.clone(),
            record_id.to_string(),
            actual_output.to_string(),
            Dimension::OutputTokens.tag().to_string(),
        ];
        let reply: Vec<String> = self.manager.invoke(&self.scripts.adjust, &args).await?;
        match reply.first().map(String::as_str) {
            Some("OK") => {
                let delta = reply.get(1).map(String::as_str).unwrap_or_default();
                delta.parse::<i64>().map_err(|_| {
                    RateLimitError::protocol(format!("adjust delta {:?}", delta))
                })
            }
            Some("NOT_FOUND") => {
                Err(RateLimitError::RecordNotFound { record_id: record_id.clone() })
            }
            other => Err(RateLimitError::protocol(format!("adjust reply {:?}", other))),
        }
    }

    async fn status(
        &self,
        ceilings: &[(Dimension, u64)],
    ) -> Result<Vec<(Dimension, u64)>, RateLimitError> {
        let mut args = vec![self.namespace.clone(), ceilings.len().to_string()];
        for (dimension, ceiling) in ceilings {
            args.push(dimension.tag().to_string());
            args.push(ceiling.to_string());
        }

        let reply: Vec<String> = self.manager.invoke(&self.scripts.status, &args).await?;
        reply
            .chunks(2)
            .map(|pair| match pair {
                [tag, remaining] => {
                    let dimension = Dimension::from_tag(tag).ok_or_else(|| {
                        RateLimitError::protocol(format!("unknown dimension tag {:?}", tag))
                    })?;
                    let remaining = remaining.parse::<u64>().map_err(|_| {
                        RateLimitError::protocol(format!("remaining {:?}", remaining))
                    })?;
                    Ok((dimension, remaining))
                }
                _ => Err(RateLimitError::protocol("odd status reply length".to_string())),
            })
            .collect()
    }
}
