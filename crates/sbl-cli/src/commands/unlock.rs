//! Unlock command - SecurityAccess with the configured profile

use anyhow::{Context, Result};
use sbl_uds::{DiagnosticSession, FlashConfig, SecurityAccessEngine, SecurityVariant};
use serde_json::json;

use crate::link::Link;
use crate::output::OutputContext;

pub async fn unlock(
    config: &FlashConfig,
    level: Option<u8>,
    simulate: bool,
    ctx: &OutputContext,
) -> Result<()> {
    let link = Link::connect(config, simulate).await?;
    let result = run(&link, config, level, ctx).await;
    link.close().await;
    result
}

async fn run(link: &Link, config: &FlashConfig, level: Option<u8>, ctx: &OutputContext) -> Result<()> {
    let uds = link
        .uds
        .clone()
        .with_timeout(config.timing.request_timeout())
        .with_pending_timeout(config.timing.pending_timeout());

    let session = uds
        .read_active_session()
        .await
        .context("Failed to read the active session")?;
    let variant = SecurityVariant::from_session(session);
    let profile = config.security.profile(variant);
    let level = level.unwrap_or(profile.level);

    ctx.info(&format!(
        "Session: {}, unlocking level 0x{:02X} ({})",
        session,
        level,
        profile.algorithm.name()
    ));

    let mut engine = SecurityAccessEngine::new(uds, config.security.delay());
    engine
        .unlock(level, &profile.algorithm)
        .await
        .with_context(|| format!("Security access for level 0x{:02X} failed", level))?;

    ctx.json(&json!({
        "session": session.to_string(),
        "level": level,
        "algorithm": profile.algorithm.name(),
        "unlocked": true,
    }));
    ctx.success("Security access granted");
    if session == DiagnosticSession::Default {
        ctx.warn("Note: the ECU relocks on the next session change");
    }
    Ok(())
}
