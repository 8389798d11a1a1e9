//! Exchanges, queues and bindings of the request pipeline.
//!
//! Each command kind owns a primary queue and a private retry chain:
//!
//! ```text
//! primary ──reject──▶ <queue>.retry[retry-tier-1] ──ttl──▶ [retry-tier-2] ── … ──ttl──▶ primary exchange
//! ```
//!
//! The last tier dead-letters back to the primary exchange with the primary
//! routing key, so the message gets one more attempt before the dispatcher
//! forwards it to the terminal queue.

use std::fmt;
use std::time::Duration;

use crate::config::{BrokerSettings, RouteSettings};
use crate::domain::commands::CommandKind;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeDecl {
    /// Exchanges are always `direct` and durable.
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDecl {
    pub name: String,
    pub dead_letter_exchange: Option<String>,
    pub dead_letter_routing_key: Option<String>,
    pub message_ttl: Option<Duration>,
}

impl QueueDecl {
    fn plain(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dead_letter_exchange: None,
            dead_letter_routing_key: None,
            message_ttl: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingDecl {
    pub exchange: String,
    pub routing_key: String,
    pub queue: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryTier {
    /// 1-based position in the escalation.
    pub level: usize,
    pub queue: String,
    pub routing_key: String,
    pub ttl: Duration,
}

/// Everything a producer or worker needs to know about one command kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRoute {
    pub kind: CommandKind,
    pub exchange: String,
    pub routing_key: String,
    pub queue: String,
    pub retry_exchange: String,
    pub tiers: Vec<RetryTier>,
    pub terminal_exchange: String,
    pub terminal_routing_key: String,
}

impl CommandRoute {
    /// Sum of all tier TTLs: the minimum delay before a rejected message is
    /// redelivered to the primary queue.
    pub fn total_backoff(&self) -> Duration {
        self.tiers.iter().map(|tier| tier.ttl).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    exchanges: Vec<ExchangeDecl>,
    queues: Vec<QueueDecl>,
    bindings: Vec<BindingDecl>,
    create: CommandRoute,
    delete: CommandRoute,
    terminal_queue: String,
}

pub fn retry_routing_key(level: usize) -> String {
    format!("retry-tier-{level}")
}

impl Topology {
    pub fn build(settings: &BrokerSettings) -> Self {
        let mut topology = Self {
            exchanges: vec![
                ExchangeDecl {
                    name: settings.exchange.clone(),
                },
                ExchangeDecl {
                    name: settings.dead_letter_exchange.clone(),
                },
            ],
            queues: vec![QueueDecl::plain(&settings.dead_letter_queue)],
            bindings: Vec::new(),
            create: route_for(CommandKind::Create, &settings.create, settings),
            delete: route_for(CommandKind::Delete, &settings.delete, settings),
            terminal_queue: settings.dead_letter_queue.clone(),
        };

        for kind in CommandKind::ALL {
            let route = topology.route(kind).clone();
            topology.add_route(&route);
        }
        topology
    }

    fn add_route(&mut self, route: &CommandRoute) {
        let first_tier_key = route
            .tiers
            .first()
            .map(|tier| tier.routing_key.clone())
            .unwrap_or_else(|| retry_routing_key(1));

        self.queues.push(QueueDecl {
            name: route.queue.clone(),
            dead_letter_exchange: Some(route.retry_exchange.clone()),
            dead_letter_routing_key: Some(first_tier_key),
            message_ttl: None,
        });
        self.bindings.push(BindingDecl {
            exchange: route.exchange.clone(),
            routing_key: route.routing_key.clone(),
            queue: route.queue.clone(),
        });

        self.exchanges.push(ExchangeDecl {
            name: route.retry_exchange.clone(),
        });
        for (index, tier) in route.tiers.iter().enumerate() {
            let (next_exchange, next_key) = match route.tiers.get(index + 1) {
                Some(next) => (route.retry_exchange.clone(), next.routing_key.clone()),
                None => (route.exchange.clone(), route.routing_key.clone()),
            };
            self.queues.push(QueueDecl {
                name: tier.queue.clone(),
                dead_letter_exchange: Some(next_exchange),
                dead_letter_routing_key: Some(next_key),
                message_ttl: Some(tier.ttl),
            });
            self.bindings.push(BindingDecl {
                exchange: route.retry_exchange.clone(),
                routing_key: tier.routing_key.clone(),
                queue: tier.queue.clone(),
            });
        }

        self.bindings.push(BindingDecl {
            exchange: route.terminal_exchange.clone(),
            routing_key: route.terminal_routing_key.clone(),
            queue: self.terminal_queue.clone(),
        });
    }

    pub fn route(&self, kind: CommandKind) -> &CommandRoute {
        match kind {
            CommandKind::Create => &self.create,
            CommandKind::Delete => &self.delete,
        }
    }

    pub fn exchanges(&self) -> &[ExchangeDecl] {
        &self.exchanges
    }

    pub fn queues(&self) -> &[QueueDecl] {
        &self.queues
    }

    pub fn bindings(&self) -> &[BindingDecl] {
        &self.bindings
    }

    pub fn queue(&self, name: &str) -> Option<&QueueDecl> {
        self.queues.iter().find(|queue| queue.name == name)
    }

    pub fn terminal_queue(&self) -> &str {
        &self.terminal_queue
    }
}

fn route_for(kind: CommandKind, names: &RouteSettings, settings: &BrokerSettings) -> CommandRoute {
    let retry_exchange = format!("{}.retry", names.queue);
    let tiers = settings
        .retry_tiers
        .iter()
        .enumerate()
        .map(|(index, ttl)| {
            let level = index + 1;
            RetryTier {
                level,
                queue: format!("{}.retry.{level}", names.queue),
                routing_key: retry_routing_key(level),
                ttl: *ttl,
            }
        })
        .collect();

    CommandRoute {
        kind,
        exchange: settings.exchange.clone(),
        routing_key: names.routing_key.clone(),
        queue: names.queue.clone(),
        retry_exchange,
        tiers,
        terminal_exchange: settings.dead_letter_exchange.clone(),
        terminal_routing_key: names.routing_key.clone(),
    }
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "exchanges (direct, durable):")?;
        for exchange in &self.exchanges {
            writeln!(f, "  {}", exchange.name)?;
        }

        writeln!(f, "queues (durable):")?;
        for queue in &self.queues {
            write!(f, "  {}", queue.name)?;
            if let Some(ttl) = queue.message_ttl {
                write!(f, " ttl={}ms", ttl.as_millis())?;
            }
            if let Some(exchange) = queue.dead_letter_exchange.as_deref() {
                write!(f, " dlx={exchange}")?;
            }
            if let Some(key) = queue.dead_letter_routing_key.as_deref() {
                write!(f, " dlk={key}")?;
            }
            writeln!(f)?;
        }

        writeln!(f, "bindings:")?;
        for binding in &self.bindings {
            writeln!(
                f,
                "  {} --[{}]--> {}",
                binding.exchange, binding.routing_key, binding.queue
            )?;
        }
        Ok(())
    }
}
