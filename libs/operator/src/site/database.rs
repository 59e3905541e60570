//! Database provisioning façade. One closed provider sum hides where the
//! database lives and how credentials are minted; the reconciler only sees
//! `provision` / `root_credentials`.

use crate::context::Context;
use crate::crd::bench::Bench;
use crate::crd::mariadb::{
    foreign_ready, Database, DatabaseSpec, Grant, GrantSpec, MariaDB, MariaDBSpec, MariaDbRef,
    MariaDbStorage, User, UserSpec, DEFAULT_ROOT_PASSWORD_KEY,
};
use crate::crd::site::Site;
use crate::crd::{DbMode, DbProvider, SecretKeyRef};
use crate::ensure;
use crate::error::{Error, Result};
use crate::MANAGED_BY_LABEL;

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, ObjectMeta, PostParams};
use kube::{Resource, ResourceExt};
use rand::distributions::Alphanumeric;
use rand::Rng;

const MARIADB_PORT: i32 = 3306;

/// Privileges granted to site users. Table-scoped only: database-level DROP
/// is excluded so leaked site credentials cannot destroy the database; the
/// drop-site job runs with root credentials instead.
pub const GRANT_PRIVILEGES: &[&str] = &[
    "SELECT",
    "INSERT",
    "UPDATE",
    "DELETE",
    "CREATE",
    "ALTER",
    "DROP",
    "INDEX",
    "REFERENCES",
    "CREATE TEMPORARY TABLES",
    "LOCK TABLES",
    "EXECUTE",
    "CREATE VIEW",
    "SHOW VIEW",
    "CREATE ROUTINE",
    "ALTER ROUTINE",
    "EVENT",
    "TRIGGER",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbInfo {
    pub provider: DbProvider,
    pub host: String,
    pub port: i32,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct DbCreds {
    pub username: String,
    pub password: String,
    pub secret_name: String,
}

/// Outcome of one provisioning pass.
pub struct ProvisionedDb {
    pub info: DbInfo,
    pub creds: Option<DbCreds>,
    pub ready: bool,
    /// Human-readable reason when the external database operator looks
    /// absent or unhealthy; surfaces as `Degraded=True`.
    pub degraded: Option<String>,
}

pub fn effective_provider(site: &Site, bench: Option<&Bench>) -> DbProvider {
    site.spec
        .db
        .as_ref()
        .and_then(|db| db.provider)
        .or_else(|| bench.and_then(|b| b.spec.db.as_ref()).map(|db| db.provider))
        .unwrap_or_default()
}

pub fn effective_mode(site: &Site, bench: Option<&Bench>) -> DbMode {
    site.spec
        .db
        .as_ref()
        .and_then(|db| db.mode)
        .or_else(|| bench.and_then(|b| b.spec.db.as_ref()).map(|db| db.mode))
        .unwrap_or_default()
}

/// Name of the MariaDB server CR for this site: the per-site server in
/// dedicated mode, the configured shared reference otherwise.
pub fn mariadb_name(site: &Site, bench: Option<&Bench>) -> Result<String> {
    match effective_mode(site, bench) {
        DbMode::Dedicated => Ok(format!("{}-mariadb", site.name_any())),
        DbMode::Shared => site
            .spec
            .db
            .as_ref()
            .and_then(|db| db.mariadb_ref.clone())
            .or_else(|| {
                bench
                    .and_then(|b| b.spec.db.as_ref())
                    .and_then(|db| db.mariadb_ref.clone())
            })
            .ok_or_else(|| {
                Error::Validation("shared database mode requires a mariadbRef".to_string())
            }),
    }
}

/// Logical database name derived from the site name; anything outside
/// `[a-z0-9_]` becomes `_` and the result is length-bounded.
pub fn logical_db_name(site_name: &str) -> String {
    let mut name: String = site_name
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    name.truncate(60);
    name
}

/// Database username for the site; MariaDB caps user names well below
/// database name length.
pub fn db_username(site_name: &str) -> String {
    let mut name = logical_db_name(site_name);
    name.truncate(30);
    name
}

pub fn credentials_secret_name(site: &str) -> String {
    format!("{site}-db-credentials")
}

pub fn root_secret_name(site: &str) -> String {
    format!("{site}-db-root")
}

pub(crate) fn generate_password() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(24)
        .map(char::from)
        .collect()
}

fn secret_labels(site: &Site) -> BTreeMap<String, String> {
    BTreeMap::from([
        (MANAGED_BY_LABEL.to_string(), crate::MANAGED_BY.to_string()),
        ("frappeop.rs/site".to_string(), site.name_any()),
    ])
}

fn owned_metadata(site: &Site, name: String) -> ObjectMeta {
    ObjectMeta {
        name: Some(name),
        namespace: site.namespace(),
        labels: Some(secret_labels(site)),
        owner_references: site.controller_owner_ref(&()).map(|o| vec![o]),
        ..ObjectMeta::default()
    }
}

// Pure builders for the foreign CRs, kept separate so the grant policy is
// directly testable.

pub fn desired_database(site: &Site, mariadb: &str) -> Database {
    let mut database = Database::new(
        &site.name_any(),
        DatabaseSpec {
            maria_db_ref: MariaDbRef {
                name: mariadb.to_string(),
                wait_for_it: Some(true),
            },
            name: Some(logical_db_name(&site.spec.site_name)),
            character_set: Some("utf8mb4".to_string()),
            collate: Some("utf8mb4_unicode_ci".to_string()),
        },
    );
    database.metadata = owned_metadata(site, site.name_any());
    database
}

pub fn desired_user(site: &Site, mariadb: &str) -> User {
    let mut user = User::new(
        &site.name_any(),
        UserSpec {
            maria_db_ref: MariaDbRef {
                name: mariadb.to_string(),
                wait_for_it: Some(true),
            },
            password_secret_key_ref: SecretKeyRef {
                name: credentials_secret_name(&site.name_any()),
                key: Some("password".to_string()),
            },
            host: Some("%".to_string()),
            max_user_connections: None,
        },
    );
    user.metadata = owned_metadata(site, site.name_any());
    user
}

pub fn desired_grant(site: &Site, mariadb: &str) -> Grant {
    let mut grant = Grant::new(
        &site.name_any(),
        GrantSpec {
            maria_db_ref: MariaDbRef {
                name: mariadb.to_string(),
                wait_for_it: Some(true),
            },
            privileges: GRANT_PRIVILEGES.iter().map(|p| p.to_string()).collect(),
            database: logical_db_name(&site.spec.site_name),
            table: "*".to_string(),
            username: db_username(&site.spec.site_name),
            host: Some("%".to_string()),
            grant_option: false,
        },
    );
    grant.metadata = owned_metadata(site, site.name_any());
    grant
}

pub fn desired_mariadb(site: &Site, name: &str) -> MariaDB {
    let mut mariadb = MariaDB::new(
        name,
        MariaDBSpec {
            root_password_secret_key_ref: Some(SecretKeyRef {
                name: root_secret_name(&site.name_any()),
                key: Some(DEFAULT_ROOT_PASSWORD_KEY.to_string()),
            }),
            replicas: Some(1),
            storage: Some(MariaDbStorage {
                size: "5Gi".to_string(),
            }),
        },
    );
    mariadb.metadata = owned_metadata(site, name.to_string());
    mariadb
}

/// Converge the site's database and report readiness. Creating the foreign
/// CRs is idempotent; readiness follows their `Ready` conditions.
pub async fn provision(
    site: &Site,
    bench: &Bench,
    ctx: &Context,
    namespace: &str,
) -> Result<ProvisionedDb> {
    match effective_provider(site, Some(bench)) {
        DbProvider::Sqlite => Ok(ProvisionedDb {
            info: DbInfo {
                provider: DbProvider::Sqlite,
                host: String::new(),
                port: 0,
                name: logical_db_name(&site.spec.site_name),
            },
            creds: None,
            ready: true,
            degraded: None,
        }),
        DbProvider::MariaDb => provision_mariadb(site, bench, ctx, namespace).await,
    }
}

async fn provision_mariadb(
    site: &Site,
    bench: &Bench,
    ctx: &Context,
    namespace: &str,
) -> Result<ProvisionedDb> {
    let mode = effective_mode(site, Some(bench));
    let mariadb = mariadb_name(site, Some(bench))?;
    let mariadbs: Api<MariaDB> = Api::namespaced(ctx.client.clone(), namespace);
    let secrets: Api<Secret> = Api::namespaced(ctx.client.clone(), namespace);

    if mode == DbMode::Dedicated {
        ensure_generated_secret(
            &secrets,
            site,
            root_secret_name(&site.name_any()),
            DEFAULT_ROOT_PASSWORD_KEY,
        )
        .await?;
        ensure::ensure(&mariadbs, desired_mariadb(site, &mariadb), ensure::create_only).await?;
    }

    let server = mariadbs.get_opt(&mariadb).await?;
    let degraded = match (&server, mode) {
        (None, DbMode::Shared) => Some(format!(
            "MariaDB resource {mariadb} not found; is the mariadb-operator installed and the shared server created?"
        )),
        _ => None,
    };

    let creds = ensure_credentials(&secrets, site).await?;

    let databases: Api<Database> = Api::namespaced(ctx.client.clone(), namespace);
    let (database, _) = ensure::ensure(&databases, desired_database(site, &mariadb), |live, want| {
        (live.spec != want.spec).then(|| {
            let mut updated = live.clone();
            updated.spec = want.spec;
            updated
        })
    })
    .await?;

    let users: Api<User> = Api::namespaced(ctx.client.clone(), namespace);
    let (user, _) = ensure::ensure(&users, desired_user(site, &mariadb), |live, want| {
        (live.spec != want.spec).then(|| {
            let mut updated = live.clone();
            updated.spec = want.spec;
            updated
        })
    })
    .await?;

    let grants: Api<Grant> = Api::namespaced(ctx.client.clone(), namespace);
    let (grant, _) = ensure::ensure(&grants, desired_grant(site, &mariadb), |live, want| {
        (live.spec != want.spec).then(|| {
            let mut updated = live.clone();
            updated.spec = want.spec;
            updated
        })
    })
    .await?;

    let server_ready = server
        .as_ref()
        .map(|s| foreign_ready(s.status.as_ref()))
        .unwrap_or(false);
    let ready = degraded.is_none()
        && server_ready
        && foreign_ready(database.status.as_ref())
        && foreign_ready(user.status.as_ref())
        && foreign_ready(grant.status.as_ref());

    Ok(ProvisionedDb {
        info: DbInfo {
            provider: DbProvider::MariaDb,
            host: mariadb,
            port: MARIADB_PORT,
            name: logical_db_name(&site.spec.site_name),
        },
        creds: Some(creds),
        ready,
        degraded,
    })
}

/// Site credentials secret: generated once, stable afterwards. Reads the
/// live values back so the init inputs always match what the User CR uses.
async fn ensure_credentials(secrets: &Api<Secret>, site: &Site) -> Result<DbCreds> {
    let secret_name = credentials_secret_name(&site.name_any());
    if let Some(existing) = secrets.get_opt(&secret_name).await? {
        let username = read_secret_key(&existing, "username")?;
        let password = read_secret_key(&existing, "password")?;
        return Ok(DbCreds {
            username,
            password,
            secret_name,
        });
    }

    let username = db_username(&site.spec.site_name);
    let password = generate_password();
    let secret = Secret {
        metadata: owned_metadata(site, secret_name.clone()),
        string_data: Some(BTreeMap::from([
            ("username".to_string(), username.clone()),
            ("password".to_string(), password.clone()),
        ])),
        type_: Some("Opaque".to_string()),
        ..Secret::default()
    };
    secrets.create(&PostParams::default(), &secret).await?;
    Ok(DbCreds {
        username,
        password,
        secret_name,
    })
}

async fn ensure_generated_secret(
    secrets: &Api<Secret>,
    site: &Site,
    name: String,
    key: &str,
) -> Result<()> {
    if secrets.get_opt(&name).await?.is_some() {
        return Ok(());
    }
    let secret = Secret {
        metadata: owned_metadata(site, name),
        string_data: Some(BTreeMap::from([(key.to_string(), generate_password())])),
        type_: Some("Opaque".to_string()),
        ..Secret::default()
    };
    secrets.create(&PostParams::default(), &secret).await?;
    Ok(())
}

/// Root credentials for destructive operations only. Shared mode resolves
/// them through the foreign CR's `rootPasswordSecretKeyRef` (key defaults to
/// `password`); dedicated mode owns a per-site root secret. Never mounted
/// into tenant-facing pods.
pub async fn root_credentials(
    site: &Site,
    bench: Option<&Bench>,
    ctx: &Context,
    namespace: &str,
) -> Result<Option<(String, String)>> {
    match effective_provider(site, bench) {
        DbProvider::Sqlite => Ok(None),
        DbProvider::MariaDb => {
            let secrets: Api<Secret> = Api::namespaced(ctx.client.clone(), namespace);
            match effective_mode(site, bench) {
                DbMode::Dedicated => {
                    let secret = secrets
                        .get_opt(&root_secret_name(&site.name_any()))
                        .await?
                        .ok_or_else(|| {
                            Error::External(format!(
                                "root secret {} not found",
                                root_secret_name(&site.name_any())
                            ))
                        })?;
                    let password = read_secret_key(&secret, DEFAULT_ROOT_PASSWORD_KEY)?;
                    Ok(Some(("root".to_string(), password)))
                }
                DbMode::Shared => {
                    let mariadb = mariadb_name(site, bench)?;
                    let mariadbs: Api<MariaDB> = Api::namespaced(ctx.client.clone(), namespace);
                    let server = mariadbs.get_opt(&mariadb).await?.ok_or_else(|| {
                        Error::External(format!("MariaDB resource {mariadb} not found"))
                    })?;
                    let key_ref = server
                        .spec
                        .root_password_secret_key_ref
                        .clone()
                        .unwrap_or_else(|| SecretKeyRef {
                            name: format!("{mariadb}-root"),
                            key: None,
                        });
                    let key = key_ref
                        .key
                        .unwrap_or_else(|| DEFAULT_ROOT_PASSWORD_KEY.to_string());
                    let secret = secrets.get_opt(&key_ref.name).await?.ok_or_else(|| {
                        Error::External(format!("root secret {} not found", key_ref.name))
                    })?;
                    let password = read_secret_key(&secret, &key)?;
                    Ok(Some(("root".to_string(), password)))
                }
            }
        }
    }
}

pub(crate) fn read_secret_key(secret: &Secret, key: &str) -> Result<String> {
    let bytes = secret
        .data
        .as_ref()
        .and_then(|data| data.get(key))
        .ok_or_else(|| Error::External(format!(
            "secret {} is missing key {key}",
            secret.name_any()
        )))?;
    String::from_utf8(bytes.0.clone())
        .map_err(|_| Error::External(format!("secret {} key {key} is not utf-8", secret.name_any())))
}
