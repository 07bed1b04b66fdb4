//! Control commands written to a verified toy

use std::time::Duration;

use nebu_proto::ble::commands;
use tracing::info;

use crate::connector::BoundSession;
use crate::radio::Link;
use crate::verifier::CapabilitySet;
use crate::RadioError;

/// Clear the toy's stored WiFi and ownership state
///
/// The toy usually drops the link on its own afterwards.
pub async fn reset<L: Link>(
    session: &BoundSession<L>,
    capabilities: &CapabilitySet,
    timeout: Duration,
) -> Result<(), RadioError> {
    let writing = session.link().write(capabilities.control.characteristic, &[commands::RESET]);
    tokio::time::timeout(timeout, writing)
        .await
        .map_err(|_| RadioError::Transport(format!("reset command timed out after {timeout:?}")))??;
    info!(peripheral = %session.handle().id, "reset command sent");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::connector::Connector;
    use crate::testing::{advert, FakePeripheral, FakeRadio, RadioEvent};
    use crate::verifier::verify;

    #[tokio::test]
    async fn reset_writes_command_byte() {
        let radio = Arc::new(FakeRadio::new());
        radio.add("a", FakePeripheral::toy("NEBU-0001"));
        let connector = Connector::new(radio.clone());
        let session = connector
            .connect(&advert("a", "NEBU-Robot-001", -45).into(), Duration::from_secs(1))
            .await
            .unwrap();
        let caps = verify(&session).await.unwrap();

        reset(&session, &caps, Duration::from_secs(1)).await.unwrap();

        assert!(radio.events().contains(&RadioEvent::Command(commands::RESET)));
        assert!(radio.frames_delivered().is_empty());
    }

    #[tokio::test]
    async fn reset_after_disconnect_fails() {
        let radio = Arc::new(FakeRadio::new());
        radio.add("a", FakePeripheral::toy("NEBU-0001"));
        let connector = Connector::new(radio.clone());
        let session = connector
            .connect(&advert("a", "NEBU-Robot-001", -45).into(), Duration::from_secs(1))
            .await
            .unwrap();
        let caps = verify(&session).await.unwrap();
        session.link().disconnect().await.unwrap();

        let err = reset(&session, &caps, Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(err, RadioError::NotConnected);
    }
}
