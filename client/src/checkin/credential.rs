//! Authentication cookie acquisition
//!
//! Fetching a credential can take arbitrarily long, so the manager never
//! blocks a checkin on it: the first request starts a background fetch and
//! fails with [`CheckinError::NoCredentialYet`]; later requests pick up the
//! cookie once the fetch has finished.

use super::CheckinError;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthCookie {
    pub name: String,
    pub value: String,
}

impl AuthCookie {
    /// Parse `name=value`
    pub fn parse(s: &str) -> Option<Self> {
        let (name, value) = s.split_once('=')?;
        let name = name.trim();
        if name.is_empty() {
            return None;
        }
        Some(Self {
            name: name.to_string(),
            value: value.trim().to_string(),
        })
    }
    
    pub fn header_value(&self) -> String {
        format!("{}={}", self.name, self.value)
    }
}

#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn fetch(&self) -> anyhow::Result<AuthCookie>;
}

/// Cookie taken verbatim from configuration
pub struct StaticCredentialProvider {
    cookie: AuthCookie,
}

impl StaticCredentialProvider {
    pub fn new(cookie: AuthCookie) -> Self {
        Self { cookie }
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentialProvider {
    async fn fetch(&self) -> anyhow::Result<AuthCookie> {
        Ok(self.cookie.clone())
    }
}

/// Login cookie accepted by a development server
pub struct DevLoginProvider {
    email: String,
}

impl DevLoginProvider {
    pub fn new(email: impl Into<String>) -> Self {
        Self { email: email.into() }
    }
}

#[async_trait]
impl CredentialProvider for DevLoginProvider {
    async fn fetch(&self) -> anyhow::Result<AuthCookie> {
        Ok(AuthCookie {
            name: "dev_appserver_login".to_string(),
            value: format!("{}:False:{}", self.email, rand::random::<u64>()),
        })
    }
}

enum CredentialState {
    Empty,
    Pending(JoinHandle<anyhow::Result<AuthCookie>>),
    Ready(AuthCookie),
}

pub struct CredentialManager {
    provider: Option<Arc<dyn CredentialProvider>>,
    state: Mutex<CredentialState>,
}

impl CredentialManager {
    /// Server that needs no credential
    pub fn anonymous() -> Self {
        Self {
            provider: None,
            state: Mutex::new(CredentialState::Empty),
        }
    }
    
    pub fn new(provider: Arc<dyn CredentialProvider>) -> Self {
        Self {
            provider: Some(provider),
            state: Mutex::new(CredentialState::Empty),
        }
    }
    
    /// Start a background fetch unless one is running or a cookie is held
    pub fn request(&self) {
        let Some(provider) = self.provider.clone() else {
            return;
        };
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if matches!(*state, CredentialState::Empty) {
            info!("Requesting auth cookie");
            *state = CredentialState::Pending(tokio::spawn(async move { provider.fetch().await }));
        }
    }
    
    /// Cookie to attach, `None` for anonymous servers. Never waits on an
    /// unfinished fetch.
    pub async fn current(&self) -> Result<Option<AuthCookie>, CheckinError> {
        if self.provider.is_none() {
            return Ok(None);
        }
        let handle = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            match std::mem::replace(&mut *state, CredentialState::Empty) {
                CredentialState::Ready(cookie) => {
                    *state = CredentialState::Ready(cookie.clone());
                    return Ok(Some(cookie));
                }
                CredentialState::Pending(handle) if handle.is_finished() => handle,
                CredentialState::Pending(handle) => {
                    *state = CredentialState::Pending(handle);
                    return Err(CheckinError::NoCredentialYet);
                }
                CredentialState::Empty => return Err(CheckinError::NoCredentialYet),
            }
        };
        
        match handle.await {
            Ok(Ok(cookie)) => {
                info!("Got auth cookie {}", cookie.name);
                *self.state.lock().unwrap_or_else(|e| e.into_inner()) = CredentialState::Ready(cookie.clone());
                Ok(Some(cookie))
            }
            Ok(Err(e)) => {
                warn!("Unable to get auth cookie: {:#}", e);
                Err(CheckinError::Credential(e.to_string()))
            }
            Err(e) => Err(CheckinError::Credential(e.to_string())),
        }
    }
    
    /// Drop the cookie; the next checkin fetches a fresh one
    pub fn invalidate(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let CredentialState::Pending(handle) = &*state {
            handle.abort();
        }
        *state = CredentialState::Empty;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    
    struct SlowProvider;
    
    #[async_trait]
    impl CredentialProvider for SlowProvider {
        async fn fetch(&self) -> anyhow::Result<AuthCookie> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            anyhow::bail!("unreachable")
        }
    }
    
    #[test]
    fn test_parse_cookie() {
        let c = AuthCookie::parse("SACSID=abc=def").unwrap();
        assert_eq!(c.name, "SACSID");
        assert_eq!(c.value, "abc=def");
        assert_eq!(c.header_value(), "SACSID=abc=def");
        assert!(AuthCookie::parse("novalue").is_none());
        assert!(AuthCookie::parse("=x").is_none());
    }
    
    #[tokio::test]
    async fn test_anonymous_needs_nothing() {
        let m = CredentialManager::anonymous();
        m.request();
        assert_eq!(m.current().await.unwrap(), None);
    }
    
    #[tokio::test]
    async fn test_first_use_fails_fast_then_succeeds() {
        let cookie = AuthCookie::parse("a=b").unwrap();
        let m = CredentialManager::new(Arc::new(StaticCredentialProvider::new(cookie.clone())));
        
        assert!(matches!(m.current().await, Err(CheckinError::NoCredentialYet)));
        m.request();
        
        let mut got = None;
        for _ in 0..100 {
            match m.current().await {
                Ok(c) => {
                    got = c;
                    break;
                }
                Err(CheckinError::NoCredentialYet) => tokio::time::sleep(Duration::from_millis(5)).await,
                Err(e) => panic!("unexpected {e}"),
            }
        }
        assert_eq!(got, Some(cookie));
        
        m.invalidate();
        assert!(matches!(m.current().await, Err(CheckinError::NoCredentialYet)));
    }
    
    #[tokio::test]
    async fn test_pending_fetch_does_not_block() {
        let m = CredentialManager::new(Arc::new(SlowProvider));
        m.request();
        let started = std::time::Instant::now();
        assert!(matches!(m.current().await, Err(CheckinError::NoCredentialYet)));
        assert!(started.elapsed() < Duration::from_secs(1));
        m.invalidate();
    }
    
    #[tokio::test]
    async fn test_dev_login_cookie() {
        let cookie = DevLoginProvider::new("test@nobody.com").fetch().await.unwrap();
        assert_eq!(cookie.name, "dev_appserver_login");
        assert!(cookie.value.starts_with("test@nobody.com:False:"));
    }
}
