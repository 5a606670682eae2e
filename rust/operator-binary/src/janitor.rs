//! Secret Janitor (spec §4.8): a standalone `Controller` over `Secret`s carrying
//! [`token::ANNOTATION_TOKEN_EXPIRATION`], deleting a token-Secret once its grace period
//! elapses. Structured as a second, independent `Controller` instance (grounded on
//! `main.rs`'s own `.watches(...)` pattern, generalized from "trigger the owner" to "react
//! to the object directly") rather than folded into the NodePool reconcile loop, since
//! this policy runs on its own clock independent of any NodePool generation change.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Secret;
use kube::api::Api;
use kube::runtime::controller::Action;
use kube::runtime::watcher;
use kube::runtime::Controller;
use kube::Client;
use snafu::Snafu;

use crate::token::ANNOTATION_TOKEN_EXPIRATION;

pub const FULL_CONTROLLER_NAME: &str = "secretjanitor.hypershift.openshift.io";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to delete expired Secret {name}: {source}"))]
    Delete { name: String, source: kube::Error },
}

pub struct Ctx {
    pub client: Client,
}

pub fn controller(client: Client) -> Controller<Secret> {
    Controller::new(Api::all(client), watcher::Config::default())
}

pub async fn reconcile(secret: Arc<Secret>, ctx: Arc<Ctx>) -> Result<Action, Error> {
    let Some(expires_at) = secret
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(ANNOTATION_TOKEN_EXPIRATION))
        .and_then(|v| chrono::DateTime::parse_from_rfc3339(v).ok())
    else {
        // Not (or no longer) marked for expiry; nothing for the janitor to do.
        return Ok(Action::await_change());
    };

    let now = chrono::Utc::now();
    let expires_at = expires_at.with_timezone(&chrono::Utc);
    if expires_at > now {
        let remaining = (expires_at - now)
            .to_std()
            .unwrap_or(Duration::from_secs(60));
        return Ok(Action::requeue(remaining));
    }

    let namespace = secret.metadata.namespace.clone().unwrap_or_default();
    let name = secret.metadata.name.clone().unwrap_or_default();
    let api: Api<Secret> = Api::namespaced(ctx.client.clone(), &namespace);
    match api.delete(&name, &Default::default()).await {
        Ok(_) => Ok(Action::await_change()),
        Err(kube::Error::Api(e)) if e.code == 404 => Ok(Action::await_change()),
        Err(source) => Err(Error::Delete { name, source }),
    }
}

pub fn error_policy(_secret: Arc<Secret>, _error: &Error, _ctx: Arc<Ctx>) -> Action {
    Action::requeue(Duration::from_secs(30))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    use super::*;

    fn secret_with_expiry(expires_at: &str) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some("token-workers-deadbeef".to_string()),
                namespace: Some("clusters-example".to_string()),
                annotations: Some(BTreeMap::from([(
                    ANNOTATION_TOKEN_EXPIRATION.to_string(),
                    expires_at.to_string(),
                )])),
                ..ObjectMeta::default()
            },
            ..Secret::default()
        }
    }

    #[test]
    fn secret_without_expiry_annotation_is_ignored_by_parsing() {
        let secret = Secret::default();
        assert!(secret
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(ANNOTATION_TOKEN_EXPIRATION))
            .is_none());
    }

    #[test]
    fn past_expiry_parses_and_is_due() {
        let secret = secret_with_expiry("2000-01-01T00:00:00Z");
        let expires_at = secret
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(ANNOTATION_TOKEN_EXPIRATION))
            .and_then(|v| chrono::DateTime::parse_from_rfc3339(v).ok())
            .unwrap();
        assert!(expires_at.with_timezone(&chrono::Utc) < chrono::Utc::now());
    }
}
