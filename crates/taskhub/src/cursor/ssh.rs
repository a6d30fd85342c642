use std::collections::HashMap;
use std::sync::Mutex;

use chrono::Utc;
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::error::{ServiceError, ServiceResult};
use taskhub_models::{RegisterSshContext, SshContext};

/// Keyed cache of remote-development connection descriptors. Entries are
/// created and removed explicitly; nothing expires on its own. Commands
/// copy a context by value at submission time, so removal never touches
/// in-flight work.
#[derive(Default)]
pub struct SshContextCache {
    contexts: Mutex<HashMap<String, SshContext>>,
}

impl SshContextCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, id: &str, input: &RegisterSshContext) -> ServiceResult<SshContext> {
        if input.host.is_empty() || input.username.is_empty() {
            return Err(ServiceError::Validation(
                "host and username are required".to_string(),
            ));
        }
        let ctx = SshContext {
            host: input.host.clone(),
            port: input.port.unwrap_or(22),
            username: input.username.clone(),
            key_path: input.key_path.clone(),
            working_directory: input.working_directory.clone(),
            environment: input.environment.clone().unwrap_or_default(),
            connection_timeout: input.connection_timeout.unwrap_or(10),
            last_verified: None,
            is_active: false,
        };
        self.contexts
            .lock()
            .unwrap()
            .insert(id.to_string(), ctx.clone());
        Ok(ctx)
    }

    pub fn get(&self, id: &str) -> Option<SshContext> {
        self.contexts.lock().unwrap().get(id).cloned()
    }

    pub fn remove(&self, id: &str) -> bool {
        self.contexts.lock().unwrap().remove(id).is_some()
    }

    pub fn count(&self) -> usize {
        self.contexts.lock().unwrap().len()
    }

    pub fn list(&self) -> Vec<(String, SshContext)> {
        let mut entries: Vec<(String, SshContext)> = self
            .contexts
            .lock()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// Connectivity probe: a TCP connect to host:port within the context's
    /// timeout. Updates last_verified / is_active either way.
    pub async fn verify(&self, id: &str) -> ServiceResult<SshContext> {
        let ctx = self
            .get(id)
            .ok_or_else(|| ServiceError::NotFound(format!("ssh context {}", id)))?;

        let addr = format!("{}:{}", ctx.host, ctx.port);
        let reachable = matches!(
            timeout(
                std::time::Duration::from_secs(ctx.connection_timeout),
                TcpStream::connect(&addr),
            )
            .await,
            Ok(Ok(_))
        );

        let mut contexts = self.contexts.lock().unwrap();
        let Some(entry) = contexts.get_mut(id) else {
            // Removed while probing; report on the snapshot we had.
            return Err(ServiceError::NotFound(format!("ssh context {}", id)));
        };
        entry.last_verified = Some(Utc::now());
        entry.is_active = reachable;
        Ok(entry.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(host: &str) -> RegisterSshContext {
        RegisterSshContext {
            host: host.to_string(),
            port: Some(1),
            username: "dev".to_string(),
            key_path: None,
            working_directory: Some("/srv/app".to_string()),
            environment: None,
            connection_timeout: Some(1),
        }
    }

    #[test]
    fn add_get_remove_round_trip() {
        let cache = SshContextCache::new();
        let ctx = cache.add("dev-box", &sample("dev.example.com")).unwrap();
        assert_eq!(ctx.port, 1);
        assert!(!ctx.is_active);
        assert_eq!(cache.count(), 1);
        assert_eq!(cache.get("dev-box").unwrap().host, "dev.example.com");
        assert!(cache.remove("dev-box"));
        assert!(!cache.remove("dev-box"));
        assert!(cache.get("dev-box").is_none());
    }

    #[test]
    fn add_requires_host_and_username() {
        let cache = SshContextCache::new();
        let mut input = sample("");
        assert!(matches!(
            cache.add("x", &input),
            Err(ServiceError::Validation(_))
        ));
        input.host = "h".to_string();
        input.username = String::new();
        assert!(matches!(
            cache.add("x", &input),
            Err(ServiceError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn verify_marks_unreachable_host_inactive() {
        let cache = SshContextCache::new();
        // RFC 5737 TEST-NET address: never routable, connect fails fast or
        // times out within the 1s context timeout.
        cache.add("dead", &sample("192.0.2.1")).unwrap();
        let ctx = cache.verify("dead").await.unwrap();
        assert!(!ctx.is_active);
        assert!(ctx.last_verified.is_some());
    }

    #[tokio::test]
    async fn verify_unknown_context_is_not_found() {
        let cache = SshContextCache::new();
        assert!(matches!(
            cache.verify("ghost").await,
            Err(ServiceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn verify_reachable_host_sets_active() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let cache = SshContextCache::new();
        let mut input = sample("127.0.0.1");
        input.port = Some(port);
        cache.add("local", &input).unwrap();
        let ctx = cache.verify("local").await.unwrap();
        assert!(ctx.is_active);
    }
}
