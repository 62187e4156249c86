use std::path::Path;

use anyhow::{Context, Result, bail};
use headless_ais::{AisConfig, DownstreamKind, HeadlessAis, RetryPolicy, SecondarySystem};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

pub struct CommandExecutor {
    ais: HeadlessAis,
    json: bool,
}

impl CommandExecutor {
    pub async fn new(config: AisConfig, json: bool) -> Result<Self> {
        let ais = HeadlessAis::builder(config)
            .build()
            .await
            .context("building academic system client")?;

        let mut events = ais.events();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                info!(event = event.event_name(), "{}", event.to_message());
            }
        });

        Ok(Self { ais, json })
    }

    pub async fn remember(&self, account: &str, password: Option<String>) -> Result<()> {
        let password = match password {
            Some(password) => password,
            None => read_password().await?,
        };
        if password.is_empty() {
            bail!("password must not be empty");
        }

        self.ais.remember(account, &password).await?;
        self.print(
            json!({ "status": "ok", "account": account }),
            format!("✓ Stored credential for {account}"),
        );
        Ok(())
    }

    pub async fn login(&self) -> Result<()> {
        let token = self.ais.login().await?;
        self.print(
            json!({
                "status": "ok",
                "account": token.source_identifier,
                "generation": token.generation,
                "obtained_at": token.obtained_at,
            }),
            format!("✓ Signed in as {}", token.source_identifier),
        );
        Ok(())
    }

    pub async fn fetch(
        &self,
        path: &str,
        params: &[(String, String)],
        output: Option<&Path>,
        retry: bool,
    ) -> Result<()> {
        let params: Vec<(&str, &str)> = params
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();

        let page = if retry {
            let body = self
                .ais
                .request_with_retry(path, &params, &RetryPolicy::default())
                .await?;
            headless_ais::html::decode_big5(&body)
        } else {
            self.ais.request_text(path, &params).await?
        };

        match output {
            Some(file) => {
                tokio::fs::write(file, page.as_bytes())
                    .await
                    .with_context(|| format!("writing {}", file.display()))?;
                self.print(
                    json!({ "status": "ok", "path": path, "output": file }),
                    format!("✓ Saved {path} to {}", file.display()),
                );
            }
            None if self.json => {
                println!("{}", json!({ "status": "ok", "path": path, "body": page }));
            }
            None => println!("{page}"),
        }
        Ok(())
    }

    pub async fn secondary(&self, system: SecondarySystem, kind: DownstreamKind) -> Result<()> {
        let token = self.ais.secondary_token(system, kind).await?;
        self.print(
            json!({
                "status": "ok",
                "system": token.system,
                "kind": token.kind,
                "value": token.value,
                "expires_at": token.expires_at,
            }),
            token.value.clone(),
        );
        Ok(())
    }

    pub async fn logout(&self) -> Result<()> {
        self.ais.logout().await?;
        self.print(json!({ "status": "ok" }), "✓ Signed out".to_string());
        Ok(())
    }

    fn print(&self, json: serde_json::Value, text: String) {
        if self.json {
            println!("{json}");
        } else {
            println!("{text}");
        }
    }
}

async fn read_password() -> Result<String> {
    eprint!("Password: ");
    let mut line = String::new();
    BufReader::new(tokio::io::stdin())
        .read_line(&mut line)
        .await
        .context("reading password from stdin")?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}
