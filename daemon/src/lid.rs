//! Laptop lid state from UPower on the system bus.

use futures::StreamExt;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LidState {
    Open,
    Closed,
    /// No lid, or UPower is not reachable
    Absent,
}

impl LidState {
    fn from_closed(closed: bool) -> Self {
        if closed { Self::Closed } else { Self::Open }
    }
}

#[zbus::proxy(
    interface = "org.freedesktop.UPower",
    default_service = "org.freedesktop.UPower",
    default_path = "/org/freedesktop/UPower"
)]
trait UPower {
    #[zbus(property)]
    fn lid_is_closed(&self) -> zbus::Result<bool>;

    #[zbus(property)]
    fn lid_is_present(&self) -> zbus::Result<bool>;
}

/// Start following the lid. The receiver starts at [`LidState::Absent`] and
/// its sender is dropped if UPower is unreachable or reports no lid.
pub fn spawn_watcher() -> watch::Receiver<LidState> {
    let (tx, rx) = watch::channel(LidState::Absent);

    tokio::spawn(async move {
        if let Err(e) = follow_lid(&tx).await {
            log::info!("UPower unavailable ({}), assuming no lid", e);
        }
    });

    rx
}

async fn follow_lid(tx: &watch::Sender<LidState>) -> zbus::Result<()> {
    let connection = zbus::Connection::system().await?;
    let upower = UPowerProxy::new(&connection).await?;

    if !upower.lid_is_present().await? {
        log::info!("UPower reports no lid");
        return Ok(());
    }

    let state = LidState::from_closed(upower.lid_is_closed().await?);
    log::info!("Lid is {:?}", state);
    tx.send_replace(state);

    let mut changes = upower.receive_lid_is_closed_changed().await;
    while let Some(change) = changes.next().await {
        let state = LidState::from_closed(change.get().await?);
        log::info!("Lid changed: {:?}", state);
        if tx.send(state).is_err() {
            break;
        }
    }

    Ok(())
}
