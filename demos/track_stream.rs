use std::error::Error;
use std::time::Duration;

use firehose_sdk::auth::OAuthCredentials;
use firehose_sdk::stream::client::StreamClient;
use firehose_sdk::stream::proto::FilterParams;
use firehose_sdk::stream::supervisor::StreamStatus;
use secrecy::SecretString;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let credentials = OAuthCredentials::new(
        "REPLACE_WITH_CONSUMER_KEY",
        SecretString::new("REPLACE_WITH_CONSUMER_SECRET".to_string()),
        "REPLACE_WITH_ACCESS_TOKEN",
        SecretString::new("REPLACE_WITH_ACCESS_SECRET".to_string()),
    );
    let terms = ["rust", "tokio"];
    let run_for = Duration::from_secs(60);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let client = StreamClient::with_credentials(credentials);
        let mut handle = client.start(FilterParams::track(terms), |message| {
            match message.get("text").and_then(|text| text.as_str()) {
                Some(text) => println!("{text}"),
                None => println!("{}", message.value()),
            }
        })?;

        let deadline = tokio::time::sleep(run_for);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => {
                    handle.stop();
                    break;
                }
                status = handle.recv_status() => match status {
                    Some(StreamStatus::Reconnecting { class, wait }) => {
                        println!("reconnecting after {class} failure in {wait:?}");
                    }
                    Some(_) => {}
                    None => break,
                },
            }
        }

        let reason = handle.join().await?;
        println!("stream stopped: {reason:?}");
        Ok::<(), Box<dyn Error>>(())
    })
}
