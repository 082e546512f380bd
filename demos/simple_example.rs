use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use simmsg::{MessageConfig, MessageSystem, TemplateRegistry, UdpTransport, Value};

/// Two message systems talking over loopback UDP: B answers A's ping, A sends
/// B a chat message.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let transport_a = Arc::new(UdpTransport::bind("127.0.0.1:9100".parse()?).await?);
    let transport_b = Arc::new(UdpTransport::bind("127.0.0.1:9101".parse()?).await?);
    let host_b = transport_b.local_host()?;

    let a = MessageSystem::new(
        transport_a,
        Arc::new(TemplateRegistry::standard()),
        MessageConfig::default(),
    )?;
    let b = MessageSystem::new(
        transport_b,
        Arc::new(TemplateRegistry::standard()),
        MessageConfig::default(),
    )?;

    a.register_handler("CompletePingCheck", |message| {
        let ping_id = message
            .message
            .block("PingID")
            .and_then(|block| block.get("PingID"))
            .and_then(Value::as_u8);
        info!(from = ?message.sender, ?ping_id, "pong");
        Ok(())
    });

    b.register_handler("ChatFromViewer", |message| {
        let agent_id = message
            .message
            .block("AgentData")
            .and_then(|block| block.get("AgentId"))
            .and_then(Value::as_uuid);
        let chat_data = message.message.block("ChatData");
        let chat = chat_data
            .and_then(|block| block.get("Message"))
            .and_then(Value::as_str)
            .unwrap_or("<garbled>");
        let channel = chat_data
            .and_then(|block| block.get("Channel"))
            .and_then(Value::as_u32);
        info!(from = ?message.sender, ?agent_id, ?channel, chat, "chat received");
        Ok(())
    });

    a.new_message("StartPingCheck")?;
    a.next_block("PingID")?;
    a.add_u8("PingID", 1)?;
    a.add_u32("OldestUnacked", 0)?;
    a.send(host_b)?;

    a.new_message("ChatFromViewer")?;
    a.next_block("AgentData")?;
    a.add_uuid("AgentId", uuid::Uuid::new_v4())?;
    a.add_uuid("SessionId", uuid::Uuid::new_v4())?;
    a.next_block("ChatData")?;
    a.add_string("Message", "Hello from A")?;
    a.add_u8("Type", 1)?;
    a.add_u32("Channel", 0)?;
    a.send(host_b)?;

    // drive both systems for a moment
    let mut ticker = tokio::time::interval(Duration::from_millis(20));
    for _ in 0..50 {
        ticker.tick().await;
        a.poll();
        b.poll();
    }

    info!(stats_a = ?a.stats(), "done");
    info!(stats_b = ?b.stats(), "done");
    Ok(())
}
