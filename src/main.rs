//! blindkey - client for the blind-signing key oracle

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;

use blindkey::cli::{ClientCommand, ClientOpts};
use blindkey::client::KeyClient;
use blindkey::config::{self, ClientSettings};
use blindkey::{log, tls};

fn parse_values(values: &[String]) -> Result<Vec<Vec<u8>>> {
    values
        .iter()
        .map(|v| hex::decode(v.trim_start_matches("0x")).with_context(|| format!("invalid hex value {v:?}")))
        .collect()
}

async fn run(opts: ClientOpts, settings: ClientSettings) -> Result<()> {
    let tls_config = tls::build_client_config(&settings.tls).context("TLS configuration")?;
    let mut client = KeyClient::connect(
        &settings.host,
        settings.port,
        settings.user_id,
        Arc::new(tls_config),
        settings.rsa_length,
    )
    .await
    .with_context(|| format!("connect {}:{}", settings.host, settings.port))?
    .with_max_chunk(settings.max_chunk);

    match opts.command {
        ClientCommand::Sign { values } => {
            let blinded = parse_values(&values)?;
            let signed = client.sign_batch(&blinded).await.context("sign batch")?;
            for s in signed {
                println!("{}", hex::encode(s));
            }
            client.close().await;
        }
        ClientCommand::Fetch { path, size, out } => {
            let mut file = tokio::fs::File::create(&out)
                .await
                .with_context(|| format!("create {}", out.display()))?;
            let n = client
                .download(&path, size, &mut file)
                .await
                .with_context(|| format!("download {path}"))?;
            client.close_conn().await.context("close session")?;
            eprintln!("{} bytes -> {}", n, out.display());
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let opts = ClientOpts::parse();
    log::init(log::level_for(opts.verbose), log::LogFormat::Text);

    let mut settings: ClientSettings = config::load(opts.config.as_deref())?;
    opts.apply(&mut settings);
    settings.validate()?;

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;
    rt.block_on(run(opts, settings))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_values() {
        let v = parse_values(&["0x0a0b".to_string(), "ff".to_string()]).unwrap();
        assert_eq!(v, vec![vec![0x0a, 0x0b], vec![0xff]]);
        assert!(parse_values(&["zz".to_string()]).is_err());
    }
}
