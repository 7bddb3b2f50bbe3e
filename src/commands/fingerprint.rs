use super::common::Context;
use anyhow::Result;

/// Print the ed25519 host key a machine presents, without registering it.
pub async fn handle_get_fingerprint(host: String) -> Result<()> {
    let ctx = Context::load()?;
    let fingerprint = ctx.trust().fetch_fingerprint(&host).await?;
    o_result!("{}", fingerprint);
    Ok(())
}
