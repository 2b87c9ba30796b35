use std::sync::Arc;
use std::time::Duration;

use rpc_core::PoolKind;
use tracing::warn;

use crate::client::Client;
use crate::discovery::{Registry, StaticRegistry};
use crate::dynconfig::{ConfigStore, MemoryStore};
use crate::error::RpcError;
use crate::metrics::{MetricsSink, NoopMetrics};
use crate::middleware::{BreakerDefaults, Reporter, TracingReporter};
use crate::transport::{Codec, Dialer, FramedCodec, TcpDialer};

/// Idle connections older than this may already be closed by the server.
pub const MAX_IDLE_TIMEOUT: Duration = Duration::from_millis(2500);

#[derive(Debug, Clone)]
enum Fragment {
    Exact(String),
    Prefix(String),
    Wildcard,
}

type Fragments = Vec<Fragment>;

fn fragments_from_str(v: &str) -> Fragments {
    v.split('.')
        .filter(|s| !s.is_empty())
        .map(|s| match s {
            "*" => Fragment::Wildcard,
            _ => match s.strip_suffix('*') {
                Some(prefix) => Fragment::Prefix(prefix.to_string()),
                None => Fragment::Exact(s.to_string()),
            },
        })
        .collect()
}

fn specificity(rule: &Fragments) -> usize {
    rule.iter()
        .map(|f| match f {
            Fragment::Exact(_) => 2,
            Fragment::Prefix(_) => 1,
            Fragment::Wildcard => 0,
        })
        .sum()
}

/// Per-method timeouts. Patterns are `.`-separated fragments where `*`
/// matches any fragment and `Get*` any fragment starting with `Get`; the
/// most specific matching rule wins.
#[derive(Debug, Clone, Default)]
pub struct MethodTimeouts {
    rules: Vec<(Fragments, Duration)>,
}

impl MethodTimeouts {
    pub fn new(rules: Vec<(String, Duration)>) -> Self {
        let mut rules: Vec<_> = rules.into_iter()
            .map(|(s, d)| (fragments_from_str(&s), d))
            .collect();
        rules.sort_by_key(|(rule, _)| std::cmp::Reverse(specificity(rule)));
        Self { rules }
    }

    pub fn get(&self, method: &str) -> Option<Duration> {
        let fragments: Vec<&str> = method.split('.').filter(|s| !s.is_empty()).collect();
        self.rules.iter()
            .filter(|(rule, _)| rule.len() == fragments.len())
            .find(|(rule, _)| {
                rule.iter().zip(&fragments).all(|(r, m)| match r {
                    Fragment::Wildcard => true,
                    Fragment::Prefix(p) => m.starts_with(p.as_str()),
                    Fragment::Exact(e) => e == m,
                })
            })
            .map(|(_, d)| *d)
    }

    fn durations(&self) -> impl Iterator<Item = Duration> + '_ {
        self.rules.iter().map(|(_, d)| *d)
    }
}

/// Everything a [`Client`] is configured with; read-only once built.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// downstream service name
    pub service: String,
    pub cluster: String,
    /// pin every call to this IDC
    pub idc: Option<String>,

    pub caller: String,
    pub caller_cluster: String,
    pub env: String,
    pub local_idc: String,
    pub local_addr: String,

    pub rpc_timeout: Option<Duration>,
    pub method_timeouts: MethodTimeouts,
    pub conn_timeout: Option<Duration>,
    pub conn_retry_window: Duration,
    pub min_conn_timeout: Duration,

    pub pool: PoolKind,
    pub max_idle: usize,
    pub max_idle_timeout: Duration,

    pub breaker: BreakerDefaults,
    pub cancel_on_timeout: bool,

    pub max_retry: Option<u32>,
    pub limit_rate: f64,

    pub discovery_ttl: Duration,
    pub capacity: usize,
}

impl ClientOptions {
    pub fn new(service: &str, caller: &str) -> Self {
        Self {
            service: service.to_string(),
            cluster: String::new(),
            idc: None,
            caller: caller.to_string(),
            caller_cluster: crate::instance::DEFAULT_CLUSTER.to_string(),
            env: String::new(),
            local_idc: "lf".to_string(),
            local_addr: String::new(),
            rpc_timeout: None,
            method_timeouts: MethodTimeouts::default(),
            conn_timeout: None,
            conn_retry_window: Duration::from_secs(1),
            min_conn_timeout: Duration::from_millis(30),
            pool: PoolKind::Ephemeral,
            max_idle: 2,
            max_idle_timeout: MAX_IDLE_TIMEOUT,
            breaker: BreakerDefaults {
                enabled: true,
                error_rate: 0.5,
                min_samples: 200,
                max_concurrency: 10_000,
            },
            cancel_on_timeout: true,
            max_retry: None,
            limit_rate: 0.2,
            discovery_ttl: Duration::from_secs(30),
            capacity: 4096,
        }
    }

    /// Timeout for `method`: a matching method rule, else the client default.
    pub fn timeout_for(&self, method: &str) -> Option<Duration> {
        self.method_timeouts.get(method).or(self.rpc_timeout)
    }

    pub fn validate(&mut self) -> Result<(), RpcError> {
        let invalid = |msg: String| Err(RpcError::Config(msg));
        if self.service.is_empty() {
            return invalid("empty service name".into());
        }
        if self.caller.is_empty() {
            return invalid(format!("empty caller name for {}", self.service));
        }
        let b = &self.breaker;
        if !(b.error_rate > 0.0 && b.error_rate <= 1.0) {
            return invalid(format!("breaker error rate {} not in (0, 1]", b.error_rate));
        }
        if b.min_samples == 0 {
            return invalid("breaker min samples is zero".into());
        }
        if b.max_concurrency == 0 {
            return invalid("breaker max concurrency is zero".into());
        }
        let zero = |d: Option<Duration>| d.is_some_and(|d| d.is_zero());
        if zero(self.rpc_timeout) || zero(self.conn_timeout) || self.method_timeouts.durations().any(|d| d.is_zero()) {
            return invalid(format!("zero timeout for {}", self.service));
        }
        if self.conn_retry_window.is_zero() || self.min_conn_timeout.is_zero() {
            return invalid("zero connect retry window or dial timeout".into());
        }
        if !(0.0..=1.0).contains(&self.limit_rate) {
            return invalid(format!("retry limit rate {} not in [0, 1]", self.limit_rate));
        }
        if self.capacity == 0 {
            return invalid("zero keyed map capacity".into());
        }
        if self.pool == PoolKind::Persistent {
            if self.max_idle == 0 {
                return invalid("persistent pool with zero max idle".into());
            }
            if self.max_idle_timeout.is_zero() {
                return invalid("persistent pool with zero idle timeout".into());
            }
        }
        if self.max_idle_timeout > MAX_IDLE_TIMEOUT {
            warn!(
                service = %self.service,
                requested = ?self.max_idle_timeout,
                cap = ?MAX_IDLE_TIMEOUT,
                "idle timeout capped"
            );
            self.max_idle_timeout = MAX_IDLE_TIMEOUT;
        }
        Ok(())
    }
}

/// External collaborators of a client. Defaults: no static instances, an
/// in-memory config store, no metrics, framed codec over TCP, and config
/// reports as tracing events.
#[derive(Clone)]
pub struct Collaborators {
    pub registry: Arc<dyn Registry>,
    pub store: Arc<dyn ConfigStore>,
    pub metrics: Arc<dyn MetricsSink>,
    pub codec: Arc<dyn Codec>,
    pub dialer: Arc<dyn Dialer>,
    pub reporter: Arc<dyn Reporter>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            registry: Arc::new(StaticRegistry::new()),
            store: Arc::new(MemoryStore::new()),
            metrics: Arc::new(NoopMetrics),
            codec: Arc::new(FramedCodec),
            dialer: Arc::new(TcpDialer),
            reporter: Arc::new(TracingReporter),
        }
    }
}

/// Fluent construction of a validated [`Client`].
pub struct ClientBuilder {
    options: ClientOptions,
    deps: Collaborators,
}

impl ClientBuilder {
    pub fn new(service: &str, caller: &str) -> Self {
        Self {
            options: ClientOptions::new(service, caller),
            deps: Collaborators::default(),
        }
    }

    pub fn cluster(mut self, cluster: &str) -> Self {
        self.options.cluster = cluster.to_string();
        self
    }

    pub fn idc(mut self, idc: &str) -> Self {
        self.options.idc = Some(idc.to_string());
        self
    }

    pub fn caller_cluster(mut self, cluster: &str) -> Self {
        self.options.caller_cluster = cluster.to_string();
        self
    }

    pub fn env(mut self, env: &str) -> Self {
        self.options.env = env.to_string();
        self
    }

    pub fn local_idc(mut self, idc: &str) -> Self {
        self.options.local_idc = idc.to_string();
        self
    }

    pub fn local_addr(mut self, addr: &str) -> Self {
        self.options.local_addr = addr.to_string();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.options.rpc_timeout = Some(timeout);
        self
    }

    pub fn method_timeouts(mut self, rules: Vec<(String, Duration)>) -> Self {
        self.options.method_timeouts = MethodTimeouts::new(rules);
        self
    }

    pub fn conn_timeout(mut self, timeout: Duration) -> Self {
        self.options.conn_timeout = Some(timeout);
        self
    }

    pub fn conn_retry_window(mut self, window: Duration) -> Self {
        self.options.conn_retry_window = window;
        self
    }

    pub fn pool(mut self, kind: PoolKind) -> Self {
        self.options.pool = kind;
        self
    }

    pub fn max_idle(mut self, max_idle: usize, idle_timeout: Duration) -> Self {
        self.options.max_idle = max_idle;
        self.options.max_idle_timeout = idle_timeout;
        self
    }

    pub fn breaker(mut self, error_rate: f64, min_samples: u64, max_concurrency: u64) -> Self {
        self.options.breaker = BreakerDefaults {
            enabled: self.options.breaker.enabled,
            error_rate,
            min_samples,
            max_concurrency,
        };
        self
    }

    pub fn disable_breaker(mut self) -> Self {
        self.options.breaker.enabled = false;
        self
    }

    pub fn cancel_on_timeout(mut self, cancel: bool) -> Self {
        self.options.cancel_on_timeout = cancel;
        self
    }

    pub fn retry(mut self, max_retry: u32, limit_rate: f64) -> Self {
        self.options.max_retry = Some(max_retry);
        self.options.limit_rate = limit_rate;
        self
    }

    pub fn discovery_ttl(mut self, ttl: Duration) -> Self {
        self.options.discovery_ttl = ttl;
        self
    }

    pub fn capacity(mut self, capacity: usize) -> Self {
        self.options.capacity = capacity;
        self
    }

    pub fn registry(mut self, registry: Arc<dyn Registry>) -> Self {
        self.deps.registry = registry;
        self
    }

    pub fn store(mut self, store: Arc<dyn ConfigStore>) -> Self {
        self.deps.store = store;
        self
    }

    pub fn metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.deps.metrics = metrics;
        self
    }

    pub fn codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.deps.codec = codec;
        self
    }

    pub fn dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.deps.dialer = dialer;
        self
    }

    pub fn reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.deps.reporter = reporter;
        self
    }

    pub fn collaborators(mut self, deps: Collaborators) -> Self {
        self.deps = deps;
        self
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    pub fn build(self) -> Result<Client, RpcError> {
        let mut options = self.options;
        options.validate()?;
        Ok(Client::new(options, self.deps))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn test_method_timeouts() {
        let rules = MethodTimeouts::new(vec![
            ("*".to_string(), ms(300)),
            ("Get*".to_string(), ms(100)),
            ("GetUser".to_string(), ms(50)),
            ("Admin.*".to_string(), ms(900)),
        ]);
        assert_eq!(rules.get("GetUser"), Some(ms(50)));
        assert_eq!(rules.get("GetOrder"), Some(ms(100)));
        assert_eq!(rules.get("Put"), Some(ms(300)));
        assert_eq!(rules.get("Admin.Reset"), Some(ms(900)));
        assert_eq!(rules.get("A.B.C"), None);
    }

    #[test]
    fn test_timeout_for_falls_back() {
        let mut o = ClientOptions::new("callee", "caller");
        assert_eq!(o.timeout_for("Get"), None);
        o.rpc_timeout = Some(ms(200));
        o.method_timeouts = MethodTimeouts::new(vec![("Slow".to_string(), ms(2000))]);
        assert_eq!(o.timeout_for("Get"), Some(ms(200)));
        assert_eq!(o.timeout_for("Slow"), Some(ms(2000)));
    }

    #[test]
    fn test_validation() {
        assert!(ClientBuilder::new("", "caller").build().is_err());
        assert!(ClientBuilder::new("callee", "caller").breaker(1.5, 10, 10).build().is_err());
        assert!(ClientBuilder::new("callee", "caller").breaker(0.5, 10, 0).build().is_err());
        assert!(ClientBuilder::new("callee", "caller").timeout(Duration::ZERO).build().is_err());
        assert!(ClientBuilder::new("callee", "caller").capacity(0).build().is_err());
        assert!(ClientBuilder::new("callee", "caller")
            .method_timeouts(vec![("Get".into(), Duration::ZERO)])
            .build()
            .is_err());
    }

    #[test]
    fn test_idle_timeout_capped() {
        let mut o = ClientOptions::new("callee", "caller");
        o.pool = PoolKind::Persistent;
        o.max_idle_timeout = Duration::from_secs(10);
        o.validate().unwrap();
        assert_eq!(o.max_idle_timeout, MAX_IDLE_TIMEOUT);
    }
}
