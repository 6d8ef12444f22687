//! Connection bootstrap for the backing document store.
//!
//! [`connect`] turns [`MongoSettings`] into a validated [`Client`]:
//!
//! - the URI must carry an explicit scheme (checked before any network I/O)
//! - credentials are attached when a username is configured; the password only
//!   when non-empty, so mechanism-based auth (e.g. X.509) keeps working
//! - writes are acknowledged by the primary and committed to the journal
//!   (`w: 1, j: true`)
//! - reads are linearizable when the deployment is a replica set
//! - connect + `ping` must finish within `connect_timeout`
//!
//! No collections are created here.

use std::time::Duration;

use bson::doc;
use mongodb::options::{
    Acknowledgment, ClientOptions, Credential, ReadConcern, ReadConcernLevel, Tls, TlsOptions,
    WriteConcern,
};
use mongodb::Client;
use thiserror::Error;
use tracing::{info, instrument};

use crate::config::MongoSettings;

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("invalid store URL {0:?}: missing scheme")]
    MissingScheme(String),

    #[error("invalid store URL: {0}")]
    InvalidUri(#[source] mongodb::error::Error),

    #[error("failed to connect to store: {0}")]
    Connect(#[source] mongodb::error::Error),

    #[error("error reaching store: {0}")]
    Ping(#[source] mongodb::error::Error),

    #[error("store bootstrap did not complete within {0:?}")]
    Timeout(Duration),
}

/// Connect, configure durability/consistency, and ping the server.
#[instrument(skip(settings), fields(uri = %redact_uri(&settings.uri)), err)]
pub async fn connect(settings: &MongoSettings) -> Result<Client, ConnectError> {
    if !settings.uri.contains("://") {
        return Err(ConnectError::MissingScheme(settings.uri.clone()));
    }

    tokio::time::timeout(settings.connect_timeout, bootstrap(settings))
        .await
        .map_err(|_| ConnectError::Timeout(settings.connect_timeout))?
}

async fn bootstrap(settings: &MongoSettings) -> Result<Client, ConnectError> {
    let mut options = ClientOptions::parse(settings.uri.as_str())
        .await
        .map_err(ConnectError::InvalidUri)?;
    apply_settings(&mut options, settings);

    let linearizable = reads_linearizable(&options);
    let client = Client::with_options(options).map_err(ConnectError::Connect)?;

    client
        .database("admin")
        .run_command(doc! { "ping": 1 })
        .await
        .map_err(ConnectError::Ping)?;

    info!(linearizable, "connected to document store");
    Ok(client)
}

/// Apply credentials, TLS, and the durability/consistency policy to parsed options.
pub fn apply_settings(options: &mut ClientOptions, settings: &MongoSettings) {
    if let Some(username) = settings.username.as_deref().filter(|u| !u.is_empty()) {
        let mut credential = Credential::default();
        credential.username = Some(username.to_string());
        credential.password = settings.password.clone().filter(|p| !p.is_empty());
        options.credential = Some(credential);
    }

    if let Some(tls) = settings.tls {
        let mut tls_options = TlsOptions::default();
        tls_options.allow_invalid_certificates = Some(tls.skip_verify);
        options.tls = Some(Tls::Enabled(tls_options));
    }

    let mut write_concern = WriteConcern::default();
    write_concern.w = Some(Acknowledgment::Nodes(1));
    write_concern.journal = Some(true);
    options.write_concern = Some(write_concern);

    if options.repl_set_name.is_some() {
        options.read_concern = Some(ReadConcern::linearizable());
    }
}

fn reads_linearizable(options: &ClientOptions) -> bool {
    options
        .read_concern
        .as_ref()
        .is_some_and(|rc| rc.level == ReadConcernLevel::Linearizable)
}

/// Strip `user:password@` from a connection URL for logging.
fn redact_uri(uri: &str) -> String {
    match (uri.find("://"), uri.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***{}", &uri[..scheme_end], &uri[at..])
        }
        _ => uri.to_string(),
    }
}
