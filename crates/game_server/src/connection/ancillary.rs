//! Per-connection UI and trade state.
//!
//! The network core does not know what a gump or a trade is; it only tracks
//! handles to them so that their number can be capped and so that game logic
//! receives every open handle back when the connection goes away.

use super::Serial;

/// An open gump window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GumpHandle {
    pub serial: Serial,
    pub type_id: u32,
}

/// An open item or question menu.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MenuHandle {
    pub serial: Serial,
}

/// An open hue picker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HuePickerHandle {
    pub serial: Serial,
}

/// A secure trade in progress, identified by its trade container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TradeHandle {
    pub container: Serial,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct AncillaryState {
    pub gumps: Vec<GumpHandle>,
    pub menus: Vec<MenuHandle>,
    pub hue_pickers: Vec<HuePickerHandle>,
    pub trades: Vec<TradeHandle>,
}

/// Everything game logic must clean up for a disconnected client.
///
/// Handed to [`crate::ConnectionEvents::on_disconnected`] from the deferred
/// disposal pass, outside any socket callback.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Detached {
    /// Avatar the connection was attached to, if it got in game
    pub avatar: Option<Serial>,
    pub account: Option<String>,
    pub gumps: Vec<GumpHandle>,
    pub menus: Vec<MenuHandle>,
    pub hue_pickers: Vec<HuePickerHandle>,
    pub trades: Vec<TradeHandle>,
}

impl Detached {
    pub(crate) fn new(avatar: Option<Serial>, account: Option<String>, state: AncillaryState) -> Self {
        Self {
            avatar,
            account,
            gumps: state.gumps,
            menus: state.menus,
            hue_pickers: state.hue_pickers,
            trades: state.trades,
        }
    }
}
