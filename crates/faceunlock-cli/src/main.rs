use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use reqwest::multipart::{Form, Part};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "faceunlock", about = "faceunlock client: unlock and enroll faces")]
struct Cli {
    /// Base URL of the faceunlockd service
    #[arg(
        long,
        global = true,
        env = "FACEUNLOCK_SERVER",
        default_value = "http://localhost:8000"
    )]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Try to unlock with a face photo
    Unlock {
        /// Image file (JPEG or PNG)
        image: PathBuf,
    },
    /// Create a one-time enrollment link
    Link,
    /// Enroll a face with a one-time token
    Enroll {
        /// Token from `faceunlock link`
        token: String,
        /// Name to enroll under
        #[arg(short, long)]
        name: String,
        /// Image file (JPEG or PNG)
        image: PathBuf,
    },
    /// Show service status
    Status,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let client = reqwest::Client::new();

    match cli.command {
        Commands::Unlock { image } => {
            let form = Form::new().part("image", image_part(&image).await?);
            let body = send(client.post(endpoint(&cli.server, "/unlock")).multipart(form)).await?;
            print_json(&body)?;
            if body["status"] != "ok" {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Link => {
            let body = send(client.post(endpoint(&cli.server, "/generate_enroll_link"))).await?;
            print_json(&body)?;
        }
        Commands::Enroll { token, name, image } => {
            let form = Form::new()
                .text("name", name)
                .part("image", image_part(&image).await?);
            let url = endpoint(&cli.server, &format!("/enroll/{token}"));
            let body = send(client.post(url).multipart(form)).await?;
            print_json(&body)?;
        }
        Commands::Status => {
            let body = send(client.get(endpoint(&cli.server, "/status"))).await?;
            print_json(&body)?;
        }
    }

    Ok(ExitCode::SUCCESS)
}

/// Send a request and decode its JSON body; non-2xx responses become errors.
async fn send(request: reqwest::RequestBuilder) -> Result<Value> {
    let response = request.send().await.context("faceunlockd unreachable")?;
    let status = response.status();
    tracing::debug!(%status, url = %response.url(), "response received");

    let body: Value = response.json().await.unwrap_or(Value::Null);
    if !status.is_success() {
        let reason = body
            .get("error")
            .or_else(|| body.get("detail"))
            .and_then(Value::as_str)
            .unwrap_or("no details");
        bail!("request failed ({status}): {reason}");
    }
    Ok(body)
}

async fn image_part(path: &Path) -> Result<Part> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "capture.jpg".to_string());
    Ok(Part::bytes(bytes)
        .file_name(file_name)
        .mime_str(mime_for(path))?)
}

fn mime_for(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("png") => "image/png",
        Some("webp") => "image/webp",
        Some("bmp") => "image/bmp",
        _ => "image/jpeg",
    }
}

fn endpoint(server: &str, path: &str) -> String {
    format!("{}{path}", server.trim_end_matches('/'))
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_joins_without_double_slash() {
        assert_eq!(endpoint("http://localhost:8000/", "/unlock"), "http://localhost:8000/unlock");
        assert_eq!(endpoint("http://h", "/status"), "http://h/status");
    }

    #[test]
    fn test_mime_for() {
        assert_eq!(mime_for(Path::new("me.PNG")), "image/png");
        assert_eq!(mime_for(Path::new("me.jpg")), "image/jpeg");
        assert_eq!(mime_for(Path::new("noext")), "image/jpeg");
    }

    #[test]
    fn test_cli_parses_enroll() {
        let cli = Cli::try_parse_from([
            "faceunlock", "--server", "http://h:1", "enroll", "tok", "--name", "alice", "a.jpg",
        ])
        .unwrap();
        assert_eq!(cli.server, "http://h:1");
        match cli.command {
            Commands::Enroll { token, name, image } => {
                assert_eq!(token, "tok");
                assert_eq!(name, "alice");
                assert_eq!(image, PathBuf::from("a.jpg"));
            }
            _ => panic!("expected enroll"),
        }
    }
}
