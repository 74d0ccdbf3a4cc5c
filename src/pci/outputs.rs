use std::{fs, path::Path};

/// Whether any DRM connector of a device has a display attached.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectedOutputs {
    Unknown,
    NoneConnected,
    HasConnected,
}

impl Default for ConnectedOutputs {
    fn default() -> Self { ConnectedOutputs::Unknown }
}

impl ConnectedOutputs {
    pub fn is_connected(self) -> bool { self == ConnectedOutputs::HasConnected }
}

/// Polls the connector `status` files beneath `<device>/drm/cardN/cardN-*`.
///
/// A device without a DRM directory, or one whose connectors can't be read, is `Unknown`.
pub fn connected_outputs(device: &Path) -> ConnectedOutputs {
    let cards = match fs::read_dir(device.join("drm")) {
        Ok(cards) => cards,
        Err(_) => return ConnectedOutputs::Unknown,
    };

    let mut found_connector = false;

    for card in cards.filter_map(Result::ok) {
        let card_name = card.file_name();
        let card_name = match card_name.to_str() {
            Some(name) if name.starts_with("card") => name.to_owned(),
            _ => continue,
        };

        let connectors = match fs::read_dir(card.path()) {
            Ok(connectors) => connectors,
            Err(_) => continue,
        };

        let prefix = [&card_name, "-"].concat();

        for connector in connectors.filter_map(Result::ok) {
            let is_connector =
                connector.file_name().to_str().map_or(false, |name| name.starts_with(&prefix));

            if !is_connector {
                continue;
            }

            let status = match fs::read_to_string(connector.path().join("status")) {
                Ok(status) => status,
                Err(_) => continue,
            };

            found_connector = true;

            if status.trim() == "connected" {
                debug!("{} is connected", connector.path().display());
                return ConnectedOutputs::HasConnected;
            }
        }
    }

    if found_connector {
        ConnectedOutputs::NoneConnected
    } else {
        ConnectedOutputs::Unknown
    }
}
