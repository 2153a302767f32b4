use std::time::Duration;

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "aws-messaging-local",
    about = "Local in-memory Amazon SQS and SNS"
)]
pub struct Args {
    #[arg(long, env = "SQS_PORT", default_value = "9324")]
    pub sqs_port: u16,
    #[arg(long, env = "SNS_PORT", default_value = "9911")]
    pub sns_port: u16,
    /// Host name used in queue URLs and unsubscribe links.
    #[arg(long, env = "ADVERTISED_HOST", default_value = "localhost")]
    pub host: String,
    #[arg(long, env = "AWS_REGION", default_value = "us-east-1")]
    pub region: String,
    #[arg(long, env = "AWS_ACCOUNT_ID", default_value = "000000000000")]
    pub account_id: String,
    #[arg(long, env = "SWEEP_INTERVAL_MS", default_value = "1000")]
    pub sweep_interval_ms: u64,
}

#[derive(Debug, Clone)]
pub struct BusConfig {
    pub account_id: String,
    pub region: String,
    pub sqs_endpoint: String,
    pub sns_endpoint: String,
    pub sweep_interval: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        BusConfig {
            account_id: "000000000000".into(),
            region: "us-east-1".into(),
            sqs_endpoint: "http://localhost:9324".into(),
            sns_endpoint: "http://localhost:9911".into(),
            sweep_interval: Duration::from_secs(1),
        }
    }
}

impl From<&Args> for BusConfig {
    fn from(args: &Args) -> Self {
        BusConfig {
            account_id: args.account_id.clone(),
            region: args.region.clone(),
            sqs_endpoint: format!("http://{}:{}", args.host, args.sqs_port),
            sns_endpoint: format!("http://{}:{}", args.host, args.sns_port),
            sweep_interval: Duration::from_millis(args.sweep_interval_ms.max(10)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_follow_host_and_ports() {
        let args = Args::parse_from([
            "aws-messaging-local",
            "--host",
            "emulator",
            "--sqs-port",
            "4566",
            "--region",
            "eu-west-1",
        ]);
        let config = BusConfig::from(&args);
        assert_eq!(config.sqs_endpoint, "http://emulator:4566");
        assert_eq!(config.sns_endpoint, "http://emulator:9911");
        assert_eq!(config.region, "eu-west-1");
    }
}
