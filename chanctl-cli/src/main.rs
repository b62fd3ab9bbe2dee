mod config;
mod observability;
mod render;
mod rest;
mod util;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use log::*;
use tokio::sync::broadcast::error::RecvError;

use chanctl::view::detail_rows;
use chanctl::{
    ChannelRegistry, CloseIntent, CloseTarget, FeeOutcome, FeePolicyManager, FeeUpdate,
    NavigationHint, NodeClient, RegistryEvent, Syncer, UnitConverter,
};

use crate::config::{load_config, Args, ChannelCommand, Command, FeesCommand, Settings};
use crate::rest::RestNode;
use crate::util::Shutter;

fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;
    let settings = Settings::resolve(&args, config)?;
    let _guard =
        observability::init_tracing_subscriber(&settings.datadir, "chanctl", &settings.log_level)?;
    info!("chanctl {} using node at {}", env!("CARGO_PKG_VERSION"), settings.url);

    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    runtime.block_on(async { App::new(settings)?.run(args.command).await })
}

struct App {
    registry: ChannelRegistry,
    fees: FeePolicyManager,
    units: Arc<UnitConverter>,
    settings: Settings,
}

impl App {
    fn new(settings: Settings) -> Result<Self> {
        let node: Arc<dyn NodeClient> = Arc::new(RestNode::from_settings(&settings)?);
        let units = match &settings.fiat {
            Some(rate) => UnitConverter::with_fiat_rate(settings.unit, rate.clone()),
            None => UnitConverter::new(settings.unit),
        };
        Ok(App {
            registry: ChannelRegistry::new(node.clone()),
            fees: FeePolicyManager::new(node),
            units: Arc::new(units),
            settings,
        })
    }

    async fn run(&self, command: Command) -> Result<()> {
        match command {
            Command::Channel(ChannelCommand::List) => self.channel_list().await,
            Command::Channel(ChannelCommand::Show { channel_point }) => {
                self.channel_show(&channel_point).await
            }
            Command::Channel(ChannelCommand::Close { channel_point, yes }) => {
                self.channel_close(&channel_point, yes).await
            }
            Command::Fees(FeesCommand::Show { channel_point }) => {
                self.fees_show(&channel_point).await
            }
            Command::Fees(FeesCommand::Set { channel_point, base_fee_msat, fee_rate }) => {
                self.fees_set(&channel_point, &base_fee_msat, &fee_rate).await
            }
            Command::Watch { interval } => {
                let interval = interval.map(Duration::from_secs);
                self.watch(interval.unwrap_or(self.settings.sync_interval)).await
            }
        }
    }

    async fn channel_list(&self) -> Result<()> {
        let snapshot = self.registry.refresh().await?;
        print!("{}", render::channel_table(snapshot.channels(), &self.registry, &self.units));
        for observation in snapshot.observations() {
            eprintln!("warning: {}", observation);
        }
        Ok(())
    }

    async fn channel_show(&self, channel_point: &str) -> Result<()> {
        let snapshot = self.registry.refresh().await?;
        let channel = self.registry.get_channel(channel_point)?;
        if let Err(e) = self.fees.fetch_policy(channel_point).await {
            warn!("showing cached fee policy for {}: {}", channel_point, e);
        }
        let policy = self.fees.get_policy(channel_point);
        let alias = self.registry.resolve_alias(&channel);
        print!("{}", render::detail_table(&detail_rows(&channel, &alias, &policy, &self.units)));
        for observation in snapshot.observations() {
            if observation.channel_point == channel_point {
                eprintln!("warning: {}", observation);
            }
        }
        Ok(())
    }

    async fn channel_close(&self, channel_point: &str, confirmed: bool) -> Result<()> {
        self.registry.refresh().await?;
        let channel = self.registry.get_channel(channel_point)?;
        let target = CloseTarget::for_channel(&channel)?;
        let alias = self.registry.resolve_alias(&channel);

        let mut intent = CloseIntent::new();
        intent.request()?;
        if !confirmed {
            println!("Closing the channel with {} ({}) cannot be undone.", alias, channel_point);
            println!("Run again with --yes to close it by {}.", target);
            intent.cancel()?;
            return Ok(());
        }
        match intent.confirm(&self.registry, &channel).await? {
            NavigationHint::ReturnToWallet => {
                println!("Close requested for the channel with {} ({}).", alias, channel_point);
                let remaining = self.registry.channels();
                print!("{}", render::channel_table(&remaining, &self.registry, &self.units));
            }
        }
        Ok(())
    }

    async fn fees_show(&self, channel_point: &str) -> Result<()> {
        let policy = self.fees.fetch_policy(channel_point).await?;
        println!("{}", render::fee_policy(channel_point, &policy));
        Ok(())
    }

    async fn fees_set(
        &self,
        channel_point: &str,
        base_fee_msat: &str,
        fee_rate: &str,
    ) -> Result<()> {
        let update = FeeUpdate::parse(base_fee_msat, fee_rate)?;
        self.registry.refresh().await?;
        self.registry.get_channel(channel_point)?;

        let result = self.fees.submit(channel_point, update).await;
        match self.fees.acknowledge(channel_point) {
            Some(FeeOutcome::Succeeded) => println!("Fee policy updated."),
            Some(FeeOutcome::Failed(message)) => eprintln!("Fee update failed: {}", message),
            None => {}
        }
        let policy = result?;
        println!("{}", render::fee_policy(channel_point, &policy));
        Ok(())
    }

    async fn watch(&self, interval: Duration) -> Result<()> {
        let shutter = Shutter::new()?;
        let mut events = self.registry.subscribe();
        let syncer = Syncer::new(self.registry.clone(), self.fees.clone(), interval);
        let handle = syncer.start(shutter.signal.clone());

        let mut last_table = String::new();
        loop {
            let signal = shutter.signal.clone();
            tokio::select! {
                event = events.recv() => match event {
                    Ok(RegistryEvent::Refreshed { generation }) => {
                        debug!("generation {}", generation);
                        let channels = self.registry.channels();
                        let table = render::channel_table(&channels, &self.registry, &self.units);
                        if table != last_table {
                            print!("{}", table);
                            last_table = table;
                        }
                    }
                    Ok(RegistryEvent::RefreshFailed(message)) => {
                        eprintln!("sync failed: {}", message)
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(n)) => warn!("missed {} registry events", n),
                    Err(RecvError::Closed) => break,
                },
                _ = signal => break,
            }
        }
        shutter.trigger.trigger();
        handle.await?;
        Ok(())
    }
}
