//! Flash command - full SBL download sequence

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use parking_lot::RwLock;
use sbl_uds::{FlashConfig, SblOrchestrator, SblProgress, SblReport, SblStep};
use sbl_vbf::VbfCatalog;
use serde_json::json;
use tabled::Tabled;

use crate::link::Link;
use crate::output::OutputContext;

const PROGRESS_POLL: Duration = Duration::from_millis(100);

#[derive(Tabled)]
struct FileRow {
    #[tabled(rename = "File")]
    name: String,
    #[tabled(rename = "Blocks")]
    blocks: usize,
    #[tabled(rename = "Bytes")]
    bytes: usize,
    #[tabled(rename = "Erased ranges")]
    erased: usize,
}

pub async fn flash(config: &FlashConfig, simulate: bool, ctx: &OutputContext) -> Result<()> {
    let catalog = config.load_catalog().context("Failed to load VBF files")?;
    check_catalog(&catalog)?;
    ctx.info(&format!(
        "Files: SBL {}, {} ESS, {} application",
        catalog.sbl.as_ref().map(|f| f.name()).unwrap_or_default(),
        catalog.ess.len(),
        catalog.application.len()
    ));

    let link = Link::connect(config, simulate).await?;
    let mut orchestrator = SblOrchestrator::from_config(link.uds.clone(), config);
    if let Some(interval) = config.timing.tester_present_interval() {
        orchestrator = orchestrator.with_tester_present(link.tester_present_sender(), interval);
    }

    let bar = ctx.interactive().then(progress_bar);
    let watcher = bar
        .clone()
        .map(|bar| tokio::spawn(watch_progress(orchestrator.progress(), bar)));

    let result = orchestrator.run(&catalog).await;

    if let Some(watcher) = watcher {
        watcher.abort();
    }
    link.close().await;

    match result {
        Ok(report) => {
            if let Some(bar) = &bar {
                bar.set_position(100);
                bar.finish_with_message("Done");
            }
            print_report(&report, ctx);
            Ok(())
        }
        Err(failure) => {
            if let Some(bar) = &bar {
                bar.abandon_with_message(format!("Failed at {}", failure.step));
            }
            ctx.json(&json!({
                "success": false,
                "step": failure.step.to_string(),
                "error": failure.source.to_string(),
            }));
            Err(failure.into())
        }
    }
}

/// Refuse to start when a file is already known to be corrupt
fn check_catalog(catalog: &VbfCatalog) -> Result<()> {
    if catalog.sbl.is_none() {
        anyhow::bail!("No SBL among the VBF files");
    }
    for file in catalog.sbl.iter().chain(&catalog.ess).chain(&catalog.application) {
        file.verify_file_checksum()
            .with_context(|| format!("{} is corrupt", file.name()))?;
    }
    Ok(())
}

fn progress_bar() -> ProgressBar {
    let bar = ProgressBar::new(100);
    let style = ProgressStyle::default_bar()
        .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}% {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=>-");
    bar.set_style(style);
    bar
}

async fn watch_progress(progress: Arc<RwLock<SblProgress>>, bar: ProgressBar) {
    let mut ticker = tokio::time::interval(PROGRESS_POLL);
    loop {
        ticker.tick().await;
        let snapshot = progress.read().clone();
        bar.set_position(percent(&snapshot));
        bar.set_message(describe(&snapshot));
    }
}

/// Byte-weighted completion; steps before the first download count as 0
fn percent(progress: &SblProgress) -> u64 {
    if progress.step == SblStep::Done {
        return 100;
    }
    if progress.bytes_total == 0 {
        return 0;
    }
    (progress.bytes_done * 100 / progress.bytes_total).min(99)
}

fn describe(progress: &SblProgress) -> String {
    match &progress.current_file {
        Some(file) => format!(
            "{} {} ({}/{})",
            progress.step,
            file,
            progress.files_done + 1,
            progress.files_total
        ),
        None => progress.step.to_string(),
    }
}

fn print_report(report: &SblReport, ctx: &OutputContext) {
    ctx.json(&json!({
        "success": true,
        "initial_session": report.initial_session.to_string(),
        "security_variant": report.variant.to_string(),
        "bytes": report.total_bytes(),
        "elapsed_ms": report.elapsed.as_millis() as u64,
        "files": report.files.iter().map(|(name, s)| json!({
            "name": name,
            "blocks": s.blocks,
            "bytes": s.bytes,
            "erased_ranges": s.erased_ranges,
        })).collect::<Vec<_>>(),
    }));

    let rows: Vec<FileRow> = report
        .files
        .iter()
        .map(|(name, summary)| FileRow {
            name: name.clone(),
            blocks: summary.blocks,
            bytes: summary.bytes,
            erased: summary.erased_ranges,
        })
        .collect();
    ctx.table(&rows);
    ctx.success(&format!(
        "Flashed {} bytes in {:.1}s",
        report.total_bytes(),
        report.elapsed.as_secs_f64()
    ));
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use sbl_vbf::{SwPartType, VbfBuilder};

    #[test]
    fn test_percent() {
        let mut progress = SblProgress::default();
        assert_eq!(percent(&progress), 0);

        progress.step = SblStep::ApplicationDownload;
        progress.bytes_total = 200;
        progress.bytes_done = 50;
        assert_eq!(percent(&progress), 25);

        progress.bytes_done = 200;
        assert_eq!(percent(&progress), 99);

        progress.step = SblStep::Done;
        assert_eq!(percent(&progress), 100);
    }

    #[test]
    fn test_describe() {
        let progress = SblProgress {
            step: SblStep::SblDownload,
            current_file: Some("sbl.vbf".to_string()),
            files_done: 0,
            files_total: 3,
            ..SblProgress::default()
        };
        assert_eq!(describe(&progress), "SBL download sbl.vbf (1/3)");
    }

    #[test]
    fn test_check_catalog_requires_sbl() {
        let app = VbfBuilder::new(SwPartType::Exe)
            .block(0x1_0000, vec![1, 2, 3])
            .build_file()
            .unwrap();
        let catalog = VbfCatalog::from_files([app]).unwrap();
        assert!(check_catalog(&catalog).is_err());
    }
}
