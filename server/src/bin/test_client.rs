//! Scripted bot: connects, walks in a circle for a few seconds, chats once and
//! prints what the server broadcasts.

use futures_util::{SinkExt, StreamExt};
use shared::{
    decode_json, decode_root, decode_snapshot, encode_action, encode_json, ControllerState,
    GameMessage, PlayerState, RootMsg,
};
use std::time::Duration;
use tokio::time::{interval, timeout};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

const SERVER_URL: &str = "ws://127.0.0.1:3000";
const BOT_NAME: &str = "TestBot";

fn describe(bytes: &[u8]) -> String {
    match decode_root(bytes) {
        Ok(RootMsg::Compressed(compressed)) => match decode_snapshot(&compressed) {
            Ok(snapshot) => format!(
                "snapshot: {} players, flags {:?}",
                snapshot.players.len(),
                snapshot.flags
            ),
            Err(e) => format!("bad snapshot: {}", e),
        },
        Ok(RootMsg::Uncompressed(GameMessage::ValidPlayers(ids))) => {
            format!("roster: {:?}", ids)
        }
        Ok(RootMsg::Uncompressed(other)) => format!("game message: {:?}", other),
        Ok(RootMsg::JsonBytes(json)) => match decode_json(&json) {
            Ok(envelope) => format!("{}: {}", envelope.topic, envelope.msg),
            Err(e) => format!("bad json: {}", e),
        },
        Err(e) => format!("undecodable frame: {}", e),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let url = std::env::args().nth(1).unwrap_or_else(|| SERVER_URL.to_string());
    println!("Connecting to {}", url);
    let (ws, _) = connect_async(url.as_str()).await?;
    let (mut write, mut read) = ws.split();

    // The first frame carries our id.
    let first = timeout(Duration::from_secs(5), read.next())
        .await?
        .ok_or("server closed before sending an id")??;
    let id = match first {
        Message::Binary(bytes) => match decode_root(&bytes)? {
            RootMsg::JsonBytes(json) => {
                let envelope = decode_json(&json)?;
                envelope.msg["id"].as_u64().ok_or("id message without id")? as u32
            }
            other => return Err(format!("expected id message, got {:?}", other).into()),
        },
        other => return Err(format!("expected binary frame, got {:?}", other).into()),
    };
    println!("Assigned id {}", id);

    let mut ticker = interval(Duration::from_millis(100));
    for step in 0..50u32 {
        ticker.tick().await;

        let angle = step as f32 / 8.0;
        let state = PlayerState {
            channel_id: id,
            controller: ControllerState {
                channel_id: id,
                stick_x: angle.cos(),
                stick_y: angle.sin(),
                buttons: 0,
            },
            pos: [9380.0 + 200.0 * angle.cos(), 7657.0, -8980.0 + 200.0 * angle.sin()],
            player_name: BOT_NAME.to_string(),
            ..Default::default()
        };
        write
            .send(Message::Binary(encode_action(&GameMessage::PlayerState(state))?))
            .await?;

        if step == 10 {
            write
                .send(Message::Binary(encode_json("chat", &"hello from the bot")?))
                .await?;
        }

        while let Ok(Some(message)) = timeout(Duration::from_millis(1), read.next()).await {
            match message? {
                Message::Binary(bytes) => println!("{}", describe(&bytes)),
                Message::Close(_) => {
                    println!("Server closed the connection");
                    return Ok(());
                }
                _ => {}
            }
        }
    }

    write.send(Message::Close(None)).await?;
    println!("Test client finished");
    Ok(())
}
