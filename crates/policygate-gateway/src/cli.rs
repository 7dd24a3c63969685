use clap::Parser;

#[derive(Parser, Debug, Default)]
#[command(name = "policygate-gateway")]
#[command(author, version, about = "Policy-gated gateway for template registrations and source-control webhooks", long_about = None)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "policygate.yaml")]
    pub config: String,

    /// Policy engine decision URL
    #[arg(short, long, env = "OPA_URL")]
    pub engine_url: Option<String>,

    /// Shared secret for webhook signatures
    #[arg(long, env = "WEBHOOK_SECRET", hide_env_values = true)]
    pub webhook_secret: Option<String>,

    /// Listen address
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Listen port
    #[arg(short = 'P', long)]
    pub port: Option<u16>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}
