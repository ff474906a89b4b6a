use anyhow::{Context, Result};
use fieldvault_core::schema::{EncryptedModel, FieldAnnotation};
use fieldvault_manager::ConnectionManager;
use tracing::instrument;

pub const HEALTH_COLLECTION: &str = "health_check";

/// Record type of the health collection; nothing in it is encrypted.
pub struct HealthProbe;

impl EncryptedModel for HealthProbe {
    const NAME: &'static str = "HealthProbe";

    fn fields() -> Vec<FieldAnnotation> {
        vec![FieldAnnotation::plain("status")]
    }
}

/// Round-trip a `ping` through an encrypted client. Initializes the manager
/// when needed, so a failure here covers key setup as well as connectivity.
#[instrument(skip_all)]
pub async fn check_database(manager: &ConnectionManager) -> Result<()> {
    let handle = manager
        .with_encrypted_collection::<HealthProbe>(HEALTH_COLLECTION)
        .await
        .context("database connection failed")?;
    handle.ping().await.context("database ping failed")?;
    Ok(())
}
