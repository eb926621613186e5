//! Tenant provisioning commands
//!
//! `gateway create-tenant <subdomain> <name> [feature,feature,...]`
//!
//! PBX connection details come from `PBX_HOST`, `PBX_PORT`, `PBX_USERNAME`
//! and `PBX_PASSWORD`; `MONTHLY_LIMIT` overrides the default call quota.
//! The generated webhook password is printed once and only its hash is stored.

use callscope_common::auth::{generate_webhook_password, hash_password};
use callscope_common::db::NewTenant;
use callscope_common::errors::{AppError, Result};
use callscope_common::Repository;
use callscope_pipeline::FeatureKind;
use tracing::info;
use validator::Validate;

const DEFAULT_MONTHLY_LIMIT: i64 = 10_000;
const DEFAULT_PBX_PORT: i32 = 8089;

#[derive(Debug, Validate)]
pub struct CreateTenantRequest {
    #[validate(length(min = 1, max = 63), custom(function = "validate_subdomain"))]
    pub subdomain: String,

    #[validate(length(min = 1, max = 200))]
    pub name: String,

    pub features: Vec<String>,

    pub pbx_host: Option<String>,

    #[validate(range(min = 1, max = 65535))]
    pub pbx_port: i32,

    pub pbx_username: Option<String>,

    pub pbx_password: Option<String>,

    #[validate(range(min = 0))]
    pub monthly_limit: i64,
}

fn validate_subdomain(subdomain: &str) -> std::result::Result<(), validator::ValidationError> {
    let valid = subdomain
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !subdomain.starts_with('-')
        && !subdomain.ends_with('-');
    if valid {
        Ok(())
    } else {
        Err(validator::ValidationError::new("subdomain"))
    }
}

/// Credentials to hand to the PBX administrator
#[derive(Debug)]
pub struct ProvisionedTenant {
    pub subdomain: String,
    pub webhook_username: String,
    pub webhook_password: String,
}

pub async fn run(repo: &Repository, args: &[String]) -> Result<()> {
    match args.first().map(String::as_str) {
        Some("create-tenant") => {
            let request = parse_create_tenant(&args[1..], |key| std::env::var(key).ok())?;
            let created = create_tenant(repo, request).await?;
            println!("tenant:           {}", created.subdomain);
            println!("webhook username: {}", created.webhook_username);
            println!("webhook password: {}", created.webhook_password);
            Ok(())
        }
        other => Err(AppError::Validation {
            message: format!(
                "unknown command {:?}; usage: create-tenant <subdomain> <name> [features]",
                other.unwrap_or("")
            ),
            field: Some("command".to_string()),
        }),
    }
}

/// Build a request from positional arguments plus environment lookups
pub fn parse_create_tenant(
    args: &[String],
    env: impl Fn(&str) -> Option<String>,
) -> Result<CreateTenantRequest> {
    let (subdomain, name) = match args {
        [subdomain, name, ..] => (subdomain.clone(), name.clone()),
        _ => {
            return Err(AppError::MissingField {
                field: "subdomain and name".to_string(),
            })
        }
    };

    let features = match args.get(2) {
        Some(list) => list
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|slug| {
                FeatureKind::from_slug(slug)
                    .map(|k| k.slug().to_string())
                    .ok_or_else(|| AppError::Validation {
                        message: format!("unknown feature '{}'", slug),
                        field: Some("features".to_string()),
                    })
            })
            .collect::<Result<Vec<_>>>()?,
        None => FeatureKind::all().iter().map(|k| k.slug().to_string()).collect(),
    };

    let parse_number = |key: &str| -> Result<Option<i64>> {
        env(key)
            .map(|v| {
                v.trim().parse::<i64>().map_err(|_| AppError::Validation {
                    message: format!("{} must be a number", key),
                    field: Some(key.to_ascii_lowercase()),
                })
            })
            .transpose()
    };

    let request = CreateTenantRequest {
        subdomain,
        name,
        features,
        pbx_host: env("PBX_HOST").filter(|h| !h.trim().is_empty()),
        pbx_port: parse_number("PBX_PORT")?.map_or(DEFAULT_PBX_PORT, |p| p as i32),
        pbx_username: env("PBX_USERNAME"),
        pbx_password: env("PBX_PASSWORD"),
        monthly_limit: parse_number("MONTHLY_LIMIT")?.unwrap_or(DEFAULT_MONTHLY_LIMIT),
    };

    request.validate().map_err(|e| AppError::Validation {
        message: e.to_string(),
        field: None,
    })?;
    Ok(request)
}

pub async fn create_tenant(repo: &Repository, request: CreateTenantRequest) -> Result<ProvisionedTenant> {
    let webhook_password = generate_webhook_password();
    let hash = tokio::task::spawn_blocking({
        let password = webhook_password.clone();
        move || hash_password(&password)
    })
    .await
    .map_err(|e| AppError::Internal {
        message: format!("password hashing failed: {}", e),
    })??;

    let pbx_enabled = request.pbx_host.is_some() && request.pbx_username.is_some();
    let tenant = repo
        .create_tenant(NewTenant {
            subdomain: request.subdomain.clone(),
            name: request.name,
            pbx_host: request.pbx_host,
            pbx_port: request.pbx_port,
            pbx_username: request.pbx_username,
            pbx_password: request.pbx_password,
            pbx_enabled,
            webhook_username: request.subdomain.clone(),
            webhook_password_hash: hash,
            enabled_features: request.features,
            monthly_limit: request.monthly_limit,
        })
        .await?;

    info!(tenant_id = %tenant.id, subdomain = %tenant.subdomain, pbx_enabled, "Tenant created");

    Ok(ProvisionedTenant {
        subdomain: tenant.subdomain,
        webhook_username: tenant.webhook_username,
        webhook_password,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_err;
    use callscope_common::auth::{verify_webhook_credentials, BasicCredentials};
    use callscope_common::db::test_pool;
    use std::collections::HashMap;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_parse_defaults_to_all_features() {
        let request = parse_create_tenant(&args(&["acme", "Acme Inc"]), env_from(&[])).unwrap();
        assert_eq!(request.features.len(), 4);
        assert_eq!(request.pbx_port, DEFAULT_PBX_PORT);
        assert_eq!(request.monthly_limit, DEFAULT_MONTHLY_LIMIT);
        assert!(request.pbx_host.is_none());
    }

    #[test]
    fn test_parse_reads_pbx_environment() {
        let request = parse_create_tenant(
            &args(&["acme", "Acme", "call-summary, sentiment-analysis"]),
            env_from(&[
                ("PBX_HOST", "10.0.0.5"),
                ("PBX_PORT", "8443"),
                ("PBX_USERNAME", "cdrapi"),
                ("MONTHLY_LIMIT", "500"),
            ]),
        )
        .unwrap();
        assert_eq!(request.features, vec!["call-summary", "sentiment-analysis"]);
        assert_eq!(request.pbx_host.as_deref(), Some("10.0.0.5"));
        assert_eq!(request.pbx_port, 8443);
        assert_eq!(request.monthly_limit, 500);
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert_err!(parse_create_tenant(&args(&["acme"]), env_from(&[])));
        assert_err!(parse_create_tenant(&args(&["Acme_Co", "Acme"]), env_from(&[])));
        assert_err!(parse_create_tenant(&args(&["acme", "Acme", "telepathy"]), env_from(&[])));
        assert!(
            parse_create_tenant(&args(&["acme", "Acme"]), env_from(&[("PBX_PORT", "http")])).is_err()
        );
    }

    #[tokio::test]
    async fn test_created_tenant_accepts_printed_credentials() {
        let repo = Repository::new(test_pool().await.unwrap());
        let request = parse_create_tenant(
            &args(&["acme", "Acme"]),
            env_from(&[("PBX_HOST", "10.0.0.5"), ("PBX_USERNAME", "cdrapi"), ("PBX_PASSWORD", "pw")]),
        )
        .unwrap();

        let created = create_tenant(&repo, request).await.unwrap();
        let tenant = repo.find_tenant_by_subdomain("acme").await.unwrap().unwrap();
        assert!(tenant.pbx_enabled);
        assert_ne!(tenant.webhook_password_hash, created.webhook_password);

        let credentials = BasicCredentials {
            username: created.webhook_username.clone(),
            password: created.webhook_password.clone(),
        };
        assert!(verify_webhook_credentials(
            &credentials,
            &tenant.webhook_username,
            &tenant.webhook_password_hash
        ));
    }

    #[tokio::test]
    async fn test_unknown_command_is_rejected() {
        let repo = Repository::new(test_pool().await.unwrap());
        assert!(run(&repo, &args(&["drop-everything"])).await.is_err());
    }
}
