use anyhow::Result;
use async_trait::async_trait;
use nebula_amqp::{Broker, Config, Delivery, DeliveryHandler, Gateway, ResumeQueue};
use std::sync::Arc;
use tracing::{error, info};

struct LogDeliveries;

#[async_trait]
impl DeliveryHandler for LogDeliveries {
    async fn handle(&self, delivery: &Delivery) -> Result<()> {
        info!(
            exchange = %delivery.exchange,
            routing_key = %delivery.routing_key,
            event = delivery.event_key.as_deref().unwrap_or(""),
            "amqp delivery"
        );
        Ok(())
    }
}

#[cfg(feature = "lapin")]
fn broker() -> Arc<dyn Broker> {
    Arc::new(nebula_amqp::broker::lapin::LapinBroker::new())
}

#[cfg(not(feature = "lapin"))]
fn broker() -> Arc<dyn Broker> {
    Arc::new(nebula_amqp::MemoryBroker::new())
}

#[tokio::main]
async fn main() -> Result<()> {
    nebula_log::init();

    let config = Config::new()?;
    let (resumer, mut resumptions) = ResumeQueue::new();
    tokio::spawn(async move {
        while let Some(resumption) = resumptions.recv().await {
            info!(
                index = resumption.transaction.index,
                label = resumption.transaction.label,
                route = %resumption.route,
                ok = resumption.result.is_ok(),
                "transaction resumed"
            );
        }
    });

    let gateway = match Gateway::start(
        config,
        broker(),
        Arc::new(LogDeliveries),
        Arc::new(resumer),
    ) {
        Ok(gateway) => gateway,
        Err(e) => {
            error!("amqp gateway failed to start: {e}");
            return Err(e.into());
        }
    };

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    gateway.shutdown().await;
    Ok(())
}
