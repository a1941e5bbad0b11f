//! Tenant resolution from the request host.
//!
//! Each school is served from its own subdomain of a platform root domain.
//! The bare root (and `www`) belongs to the platform operator and resolves to
//! no tenant; the operator may act on a school only by naming it in the
//! override header, which is audited. The override is honoured only for
//! callers the HTTP layer has already authenticated.

use std::sync::Arc;
use tracing::instrument;

use crate::error::LedgerError;
use crate::models::Tenant;
use crate::services::store::LedgerStore;

/// What the host part of a request points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostScope {
    Platform,
    Tenant(String),
}

/// How a tenant was resolved for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedVia {
    Subdomain,
    PlatformOverride,
}

/// The tenant a request acts on. Stored in request extensions once resolved.
#[derive(Debug, Clone)]
pub struct TenantContext {
    pub tenant: Tenant,
    pub via: ResolvedVia,
}

impl TenantContext {
    pub fn tenant_id(&self) -> uuid::Uuid {
        self.tenant.tenant_id
    }
}

fn strip_port(host: &str) -> &str {
    match host.rsplit_once(':') {
        Some((name, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => {
            name
        }
        _ => host,
    }
}

/// Classify a Host header against the configured root domains.
///
/// Unknown hosts fail closed with `TenantNotFound`.
pub fn classify_host(host: &str, root_domains: &[String]) -> Result<HostScope, LedgerError> {
    let host = strip_port(host.trim()).trim_end_matches('.').to_ascii_lowercase();

    for root in root_domains {
        let root = root.trim().trim_end_matches('.').to_ascii_lowercase();
        if root.is_empty() {
            continue;
        }
        if host == root {
            return Ok(HostScope::Platform);
        }
        if let Some(prefix) = host.strip_suffix(&format!(".{}", root)) {
            let label = prefix.split('.').next().unwrap_or_default();
            return match label {
                "" => Err(LedgerError::TenantNotFound(host.clone())),
                "www" => Ok(HostScope::Platform),
                sub => Ok(HostScope::Tenant(sub.to_string())),
            };
        }
    }

    Err(LedgerError::TenantNotFound(host))
}

#[derive(Clone)]
pub struct TenantResolver {
    store: Arc<dyn LedgerStore>,
    root_domains: Vec<String>,
}

impl TenantResolver {
    pub fn new(store: Arc<dyn LedgerStore>, root_domains: Vec<String>) -> Self {
        Self {
            store,
            root_domains,
        }
    }

    /// Resolve the tenant for a request from its host and optional handle.
    ///
    /// A request without a Host header is treated as a platform call.
    /// `allow_override` is false unless the caller proved who it is.
    #[instrument(skip(self), fields(tenant_id = tracing::field::Empty))]
    pub async fn resolve(
        &self,
        host: Option<&str>,
        handle: Option<&str>,
        allow_override: bool,
    ) -> Result<TenantContext, LedgerError> {
        let scope = match host {
            Some(host) => classify_host(host, &self.root_domains)?,
            None => HostScope::Platform,
        };
        let handle = handle.map(str::trim).filter(|h| !h.is_empty());

        let (subdomain, via) = match (scope, handle) {
            (HostScope::Tenant(sub), None) => (sub, ResolvedVia::Subdomain),
            (HostScope::Tenant(sub), Some(handle)) => {
                if !sub.eq_ignore_ascii_case(handle) {
                    tracing::warn!(
                        subdomain = %sub,
                        handle = %handle,
                        "Tenant handle does not match host"
                    );
                    return Err(LedgerError::TenantNotFound(handle.to_string()));
                }
                (sub, ResolvedVia::Subdomain)
            }
            (HostScope::Platform, Some(handle)) => {
                if !allow_override {
                    tracing::warn!(
                        target: "audit",
                        handle = %handle,
                        "Unauthenticated platform override refused"
                    );
                    return Err(LedgerError::Unverified(
                        "tenant override requires a signed request".to_string(),
                    ));
                }
                (handle.to_ascii_lowercase(), ResolvedVia::PlatformOverride)
            }
            (HostScope::Platform, None) => {
                return Err(LedgerError::TenantNotFound(
                    "platform host without tenant handle".to_string(),
                ))
            }
        };

        let tenant = self
            .store
            .find_tenant_by_subdomain(&subdomain)
            .await?
            .filter(|t| t.active)
            .ok_or_else(|| LedgerError::TenantNotFound(subdomain.clone()))?;

        if via == ResolvedVia::PlatformOverride {
            tracing::warn!(
                target: "audit",
                tenant_id = %tenant.tenant_id,
                subdomain = %subdomain,
                "Platform override used to act on tenant"
            );
        }

        let span = tracing::Span::current();
        span.record("tenant_id", tracing::field::display(tenant.tenant_id));

        Ok(TenantContext { tenant, via })
    }
}
