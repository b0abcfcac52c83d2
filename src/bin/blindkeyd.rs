use anyhow::{Context, Result};
use clap::Parser;

use blindkey::cli::DaemonOpts;
use blindkey::config::{self, ServerSettings};
use blindkey::{log, server};

fn main() -> Result<()> {
    let opts = DaemonOpts::parse();
    log::init(log::level_for(opts.verbose), opts.log_format);

    let mut settings: ServerSettings = config::load(opts.config.as_deref())?;
    opts.apply(&mut settings);

    tracing::info!(
        bind = %settings.bind,
        rsa_key = %settings.rsa_key.display(),
        ca_cert = %settings.tls.ca_cert.display(),
        max_batch = settings.max_batch,
        max_connections = settings.max_connections,
        "starting key oracle"
    );

    // Security warning for 0.0.0.0 binding
    if settings.bind.starts_with("0.0.0.0") {
        tracing::warn!("binding to 0.0.0.0 exposes the oracle on all interfaces");
    }

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    rt.block_on(async {
        // keys, certificates and the socket must all be usable before the
        // first accept; any failure ends the process here
        let dispatcher = server::bind(&settings).await.context("startup failed")?;
        dispatcher
            .run_until(async {
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("interrupt received, shutting down");
            })
            .await?;
        Ok::<(), anyhow::Error>(())
    })
}
