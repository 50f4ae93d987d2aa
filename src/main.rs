//! Leverage Rebalancer
//!
//! Keeps a leveraged position healthy on a CosmWasm chain:
//! - Credit facility LTV held inside a configured band
//! - Synthetic-asset CDP margins repaired or expanded toward a safe level
//! - Spare savings deposit redeployed into additional short exposure

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use rebalancer_api::{ConsoleNotifier, Event, Notifier, NotifierRegistry, TelegramNotifier};
use rebalancer_chain::{
    AnchorMarket, ChainClient, LcdClient, MirrorProtocol, MoneyMarketClient, SigningRelayBuilder,
    SyntheticProtocolClient,
};
use rebalancer_core::{BotConfig, Gateway, NetworkConfig, RebalancingEngine};

/// Environment variable names.
mod env {
    pub const TELEGRAM_BOT_TOKEN: &str = "TELEGRAM_BOT_TOKEN";
    pub const TELEGRAM_CHAT_ID: &str = "TELEGRAM_CHAT_ID";
}

#[tokio::main]
async fn main() -> Result<()> {
    print_banner();

    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                EnvFilter::new("info,rebalancer_core=debug,rebalancer_chain=debug")
            }),
        )
        .init();

    // BOT_CONFIG names a TOML file; otherwise BOT_PROFILE picks a built-in profile
    let bot_config = BotConfig::load().context("failed to load bot config")?;
    bot_config.log_config();

    let network = NetworkConfig::from_env().context("failed to load network config")?;
    info!(
        network = %network.network.name,
        chain_id = %network.network.chain_id,
        lcd = %network.network.lcd_url,
        "Network configuration loaded"
    );

    let notifier = build_notifier()?;
    let engine = initialize_engine(&bot_config, &network, notifier.clone()).await?;

    notifier.notify(Event::Started {
        network: network.network.name.clone(),
        address: network.network.wallet_address.clone(),
        ltv_limit: bot_config.ltv.limit,
        ltv_safe: bot_config.ltv.safe,
        ltv_borrow: bot_config.ltv.borrow,
    });

    info!(
        wait_for_secs = bot_config.engine.wait_for_secs,
        "Starting rebalancing loop..."
    );
    tokio::select! {
        _ = engine.run_forever() => {}
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for ctrl-c")?;
            info!("Shutdown requested");
        }
    }

    Ok(())
}

fn build_notifier() -> Result<Arc<dyn Notifier>> {
    let mut registry = NotifierRegistry::new();
    registry.register(Box::new(ConsoleNotifier));

    match (
        std::env::var(env::TELEGRAM_BOT_TOKEN),
        std::env::var(env::TELEGRAM_CHAT_ID),
    ) {
        (Ok(token), Ok(chat)) => {
            registry.register(Box::new(TelegramNotifier::new(token, chat)?));
            info!("Telegram notifications enabled");
        }
        _ => warn!("Telegram not configured, console notifications only"),
    }

    Ok(Arc::new(registry))
}

async fn initialize_engine(
    bot_config: &BotConfig,
    network: &NetworkConfig,
    notifier: Arc<dyn Notifier>,
) -> Result<RebalancingEngine> {
    info!("Initializing components...");
    let details = &network.network;
    let timeout = bot_config.engine.rpc_timeout();

    let mut relay = SigningRelayBuilder::new(&details.signer_url, &details.chain_id)
        .gas_prices(&details.gas_prices)
        .gas_adjustment(details.gas_adjustment)
        .timeout(timeout);
    if let Some(memo) = &details.memo {
        relay = relay.memo(memo);
    }
    let signer = relay.build().context("failed to build signing relay client")?;

    let chain: Arc<dyn ChainClient> = Arc::new(
        LcdClient::connect(&details.lcd_url, &details.wallet_address, signer, timeout)
            .await
            .context("failed to connect to LCD")?,
    );

    let market: Arc<dyn MoneyMarketClient> =
        Arc::new(AnchorMarket::new(chain.clone(), network.anchor_contracts()));
    let synthetic: Arc<dyn SyntheticProtocolClient> = Arc::new(MirrorProtocol::new(
        chain.clone(),
        network.mirror_contracts(),
        network.mirror_assets(),
    ));

    let watch = network.watched_symbols();
    info!(watch = ?watch, "Managing synthetic positions");

    let gateway = Gateway::new(chain, market, synthetic, &details.stable_denom, timeout);
    Ok(RebalancingEngine::new(
        gateway,
        bot_config.clone(),
        watch,
        notifier,
    ))
}

fn print_banner() {
    println!(r#"
    ╦  ┌─┐┬  ┬┌─┐┬─┐┌─┐┌─┐┌─┐
    ║  ├┤ └┐┌┘├┤ ├┬┘├─┤│ ┬├┤
    ╩═╝└─┘ └┘ └─┘┴└─┴ ┴└─┘└─┘
    Rebalancer v0.1.0
    "#);
}
