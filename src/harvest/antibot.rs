//! Outbound request shaping for scraped marketplaces: user-agent rotation,
//! proxy health, request budgets and response heuristics.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::Rng;
use reqwest::Client;
use tracing::{debug, warn};

use crate::config::ScrapingConfig;

pub const DEFAULT_USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:125.0) Gecko/20100101 Firefox/125.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.15; rv:125.0) Gecko/20100101 Firefox/125.0",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36 Edg/124.0.0.0",
];

const CAPTCHA_MARKERS: &[&str] = &[
    "captcha",
    "recaptcha",
    "hcaptcha",
    "verify you are human",
    "are you a robot",
    "cf-challenge",
];

const BLOCK_MARKERS: &[&str] = &[
    "access denied",
    "blocked",
    "rate limit",
    "too many requests",
    "forbidden",
];

/// Round-robin over a fixed pool. Lock-free: one index advance per call.
#[derive(Debug)]
pub struct UserAgentRotator {
    agents: Vec<String>,
    next: AtomicUsize,
}

impl UserAgentRotator {
    /// `preferred` goes to the front of the default pool.
    pub fn new(preferred: Option<&str>) -> Self {
        let mut agents: Vec<String> = Vec::with_capacity(DEFAULT_USER_AGENTS.len() + 1);
        if let Some(ua) = preferred.map(str::trim).filter(|s| !s.is_empty()) {
            agents.push(ua.to_string());
        }
        agents.extend(DEFAULT_USER_AGENTS.iter().map(|s| s.to_string()));
        Self {
            agents,
            next: AtomicUsize::new(0),
        }
    }

    pub fn next_agent(&self) -> &str {
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.agents.len();
        &self.agents[i]
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

/// Proxies with consecutive-failure counters. A proxy at the failure limit
/// is skipped until every proxy is, at which point all counters reset.
#[derive(Debug)]
pub struct ProxyPool {
    proxies: Vec<String>,
    failures: Mutex<Vec<u32>>,
    next: AtomicUsize,
    max_failures: u32,
}

impl ProxyPool {
    pub fn new(proxies: Vec<String>, max_failures: u32) -> Self {
        let n = proxies.len();
        Self {
            proxies,
            failures: Mutex::new(vec![0; n]),
            next: AtomicUsize::new(0),
            max_failures: max_failures.max(1),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.proxies.is_empty()
    }

    pub fn next_proxy(&self) -> Option<String> {
        if self.proxies.is_empty() {
            return None;
        }
        let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        if failures.iter().all(|f| *f >= self.max_failures) {
            warn!(proxies = self.proxies.len(), "all proxies benched; resetting failure counters");
            failures.iter_mut().for_each(|f| *f = 0);
        }
        let n = self.proxies.len();
        let start = self.next.fetch_add(1, Ordering::Relaxed);
        (0..n)
            .map(|k| (start + k) % n)
            .find(|&i| failures[i] < self.max_failures)
            .map(|i| self.proxies[i].clone())
    }

    pub fn report_failure(&self, proxy: &str) {
        if let Some(i) = self.proxies.iter().position(|p| p == proxy) {
            let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
            failures[i] += 1;
            if failures[i] == self.max_failures {
                warn!(proxy = i, "proxy benched after consecutive failures");
            }
        }
    }

    pub fn report_success(&self, proxy: &str) {
        if let Some(i) = self.proxies.iter().position(|p| p == proxy) {
            let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
            failures[i] = 0;
        }
    }
}

/// Sliding-window request budget per minute and per hour. Callers over
/// budget wait; nothing is dropped.
#[derive(Debug)]
pub struct RateLimiter {
    per_minute: u32,
    per_hour: u32,
    history: Mutex<VecDeque<Instant>>,
}

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3600);

impl RateLimiter {
    pub fn new(per_minute: u32, per_hour: u32) -> Self {
        Self {
            per_minute: per_minute.max(1),
            per_hour: per_hour.max(1),
            history: Mutex::new(VecDeque::new()),
        }
    }

    /// How long a request issued at `now` must wait.
    pub fn wait_time(&self, now: Instant) -> Duration {
        let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        Self::wait_locked(&mut history, now, self.per_minute, self.per_hour)
    }

    fn wait_locked(history: &mut VecDeque<Instant>, now: Instant, per_minute: u32, per_hour: u32) -> Duration {
        while history
            .front()
            .is_some_and(|t| now.saturating_duration_since(*t) >= HOUR)
        {
            history.pop_front();
        }
        let mut wait = Duration::ZERO;
        if history.len() >= per_hour as usize {
            let oldest = history[history.len() - per_hour as usize];
            wait = wait.max((oldest + HOUR).saturating_duration_since(now));
        }
        let in_minute = history
            .iter()
            .filter(|t| now.saturating_duration_since(**t) < MINUTE)
            .count();
        if in_minute >= per_minute as usize {
            let oldest = history[history.len() - per_minute as usize];
            wait = wait.max((oldest + MINUTE).saturating_duration_since(now));
        }
        wait
    }

    pub fn record(&self, at: Instant) {
        let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history.push_back(at);
    }

    /// Wait until a request fits both budgets, then claim a slot.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
                let now = Instant::now();
                let wait = Self::wait_locked(&mut history, now, self.per_minute, self.per_hour);
                if wait.is_zero() {
                    history.push_back(now);
                }
                wait
            };
            if wait.is_zero() {
                return;
            }
            debug!(wait_ms = wait.as_millis() as u64, "request budget exhausted; deferring");
            tokio::time::sleep(wait).await;
        }
    }
}

/// Uniform pre-request pause in `[min, max]`.
#[derive(Debug, Clone, Copy)]
pub struct HumanDelay {
    pub min: Duration,
    pub max: Duration,
}

impl HumanDelay {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max: max.max(min),
        }
    }

    pub fn sample(&self) -> Duration {
        if self.max <= self.min {
            return self.min;
        }
        let ms = rand::thread_rng().gen_range(self.min.as_millis() as u64..=self.max.as_millis() as u64);
        Duration::from_millis(ms)
    }
}

/// Captcha keyword found in the body, if any.
pub fn detect_captcha(body: &str) -> Option<&'static str> {
    let lower = body.to_lowercase();
    CAPTCHA_MARKERS.iter().copied().find(|m| lower.contains(m))
}

pub fn detect_block(status: u16, body: &str) -> bool {
    if matches!(status, 403 | 429 | 503) {
        return true;
    }
    let lower = body.to_lowercase();
    BLOCK_MARKERS.iter().any(|m| lower.contains(m))
}

/// What the anti-bot layer hands to one outbound request.
#[derive(Debug, Clone)]
pub struct RequestPlan {
    pub user_agent: String,
    pub proxy: Option<String>,
}

pub struct AntiBot {
    agents: UserAgentRotator,
    proxies: ProxyPool,
    limiter: RateLimiter,
    delay: HumanDelay,
    timeout: Duration,
    clients: Mutex<HashMap<Option<String>, Client>>,
}

impl AntiBot {
    pub fn from_config(cfg: &ScrapingConfig) -> Self {
        Self {
            agents: UserAgentRotator::new(cfg.user_agent.as_deref()),
            proxies: ProxyPool::new(cfg.proxies.clone(), cfg.proxy_max_failures),
            limiter: RateLimiter::new(cfg.requests_per_minute, cfg.requests_per_hour),
            delay: HumanDelay::new(cfg.min_delay, cfg.max_delay),
            timeout: cfg.timeout,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Wait for budget plus a human-like pause, then pick identity and route.
    pub async fn prepare(&self) -> RequestPlan {
        self.limiter.acquire().await;
        let pause = self.delay.sample();
        if !pause.is_zero() {
            tokio::time::sleep(pause).await;
        }
        RequestPlan {
            user_agent: self.agents.next_agent().to_string(),
            proxy: self.proxies.next_proxy(),
        }
    }

    /// Client for the plan's route; built once per proxy.
    pub fn client_for(&self, plan: &RequestPlan) -> anyhow::Result<Client> {
        let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(c) = clients.get(&plan.proxy) {
            return Ok(c.clone());
        }
        let mut builder = Client::builder().timeout(self.timeout);
        if let Some(proxy) = &plan.proxy {
            builder = builder.proxy(reqwest::Proxy::all(proxy)?);
        }
        let client = builder.build()?;
        clients.insert(plan.proxy.clone(), client.clone());
        Ok(client)
    }

    pub fn report(&self, plan: &RequestPlan, ok: bool) {
        if let Some(proxy) = &plan.proxy {
            if ok {
                self.proxies.report_success(proxy);
            } else {
                self.proxies.report_failure(proxy);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agents_rotate_with_preferred_first() {
        let r = UserAgentRotator::new(Some("GeekoriumBot/1.0"));
        assert_eq!(r.next_agent(), "GeekoriumBot/1.0");
        assert_eq!(r.next_agent(), DEFAULT_USER_AGENTS[0]);
        for _ in 0..r.len() - 2 {
            r.next_agent();
        }
        assert_eq!(r.next_agent(), "GeekoriumBot/1.0");
    }

    #[test]
    fn proxies_are_benched_then_reset() {
        let pool = ProxyPool::new(vec!["http://a:1".into(), "http://b:2".into()], 2);
        pool.report_failure("http://a:1");
        pool.report_failure("http://a:1");
        for _ in 0..4 {
            assert_eq!(pool.next_proxy().as_deref(), Some("http://b:2"));
        }
        pool.report_failure("http://b:2");
        pool.report_failure("http://b:2");
        // everything benched: counters reset and rotation resumes
        assert!(pool.next_proxy().is_some());
        pool.report_success("http://a:1");
    }

    #[test]
    fn minute_budget_defers() {
        let limiter = RateLimiter::new(2, 100);
        let t0 = Instant::now();
        limiter.record(t0);
        limiter.record(t0 + Duration::from_secs(10));
        let wait = limiter.wait_time(t0 + Duration::from_secs(20));
        assert_eq!(wait, Duration::from_secs(40));
        assert_eq!(limiter.wait_time(t0 + Duration::from_secs(61)), Duration::ZERO);
    }

    #[test]
    fn hour_budget_defers() {
        let limiter = RateLimiter::new(100, 3);
        let t0 = Instant::now();
        for m in 0..3 {
            limiter.record(t0 + Duration::from_secs(120 * m));
        }
        let wait = limiter.wait_time(t0 + Duration::from_secs(600));
        assert_eq!(wait, Duration::from_secs(3000));
    }

    #[test]
    fn delay_stays_in_bounds() {
        let d = HumanDelay::new(Duration::from_millis(10), Duration::from_millis(30));
        for _ in 0..50 {
            let s = d.sample();
            assert!(s >= Duration::from_millis(10) && s <= Duration::from_millis(30));
        }
    }

    #[test]
    fn detectors() {
        assert_eq!(detect_captcha("<div class='g-recaptcha'>"), Some("captcha"));
        assert_eq!(detect_captcha("Please verify you are human"), Some("verify you are human"));
        assert!(detect_captcha("<h1>Lightning Bolt</h1>").is_none());
        assert!(detect_block(429, ""));
        assert!(detect_block(200, "Access Denied"));
        assert!(!detect_block(200, "<span class='price'>$1.00</span>"));
    }
}
