//! Switch-kind extension.
//!
//! A door-switch node. The sensor parameters never vary between
//! installations, so the two channels are hard-coded here; only the colours
//! and the uplink endpoint come from the configuration. The two LEDs show the
//! node's own status: 1 = one side open, 2 = both open, anything else =
//! closed.

use crate::node::{Flags, Pending};
use crate::protocol::Command;
use crate::uplink::UplinkNotice;

/// Fixed calibration tail for both switch channels:
/// input filter, transition matrix (diagonal omitted), window sizes,
/// reject filter.
const SWITCH_CHANNEL_ARGS: &str = "0,0,1 0,16500,0,0,0,0,-16000,0,0,0,0,0 3,3,3,3 1,1";
const SWITCH_CHANNELS: usize = 2;
const SWITCH_CHANNEL_MASK: u32 = 3;
const SWITCH_SAMPLERATE: u32 = 500;

#[derive(Debug, Clone)]
pub struct SwitchState {
    pub color_opened: u32,
    pub color_closed: u32,
    pub color_pending: u32,
    /// Endpoint notified on every own status change.
    pub status_url: String,
    pub status_key: String,
    pub ch_init: usize,
    /// Status-change indicator has been configured this session.
    pub cssi_done: bool,
    pub led_expected: Vec<u32>,
    pub led_applied: Option<Vec<u32>>,
}

impl SwitchState {
    pub fn new(
        color_opened: u32,
        color_closed: u32,
        color_pending: u32,
        status_url: String,
        status_key: String,
    ) -> Self {
        SwitchState {
            color_opened,
            color_closed,
            color_pending,
            status_url,
            status_key,
            ch_init: 0,
            cssi_done: false,
            led_expected: vec![0, 0],
            led_applied: None,
        }
    }

    pub fn reset_runtime(&mut self) {
        self.ch_init = 0;
        self.cssi_done = false;
        self.led_expected = vec![0, 0];
        self.led_applied = None;
    }

    /// Fresh session on the node: the device lost its configuration.
    pub fn reset_init(&mut self) {
        self.ch_init = 0;
        self.cssi_done = false;
        self.led_applied = None;
    }

    pub fn next_message(&self, id: u32, flags: Flags) -> Option<(Command, Pending)> {
        if self.ch_init < SWITCH_CHANNELS {
            let cmd = Command::node_with_args(
                id,
                "cfg_sensor",
                format_args!("{} {}", self.ch_init, SWITCH_CHANNEL_ARGS),
            );
            return Some((cmd, Pending::Channel));
        }

        if !self.cssi_done {
            let p = self.color_pending;
            let cmd = Command::node_with_args(
                id,
                "cfg_status_change_indicator",
                format_args!("0,0,{p} 1,1,{p}"),
            );
            return Some((cmd, Pending::Indicator));
        }

        if !flags.init_done {
            let cmd = Command::node_with_args(
                id,
                "enable_sensor",
                format_args!("{SWITCH_CHANNEL_MASK} {SWITCH_SAMPLERATE}"),
            );
            return Some((cmd, Pending::Enable));
        }

        if self.led_applied.as_deref() != Some(&self.led_expected[..]) {
            let colours = self
                .led_expected
                .iter()
                .map(|c| c.to_string())
                .collect::<Vec<_>>()
                .join(" ");
            let cmd = Command::node_with_args(id, "led", colours);
            return Some((cmd, Pending::Led(self.led_expected.clone())));
        }

        None
    }

    /// A switch only cares about its own status.
    pub fn on_peer_status(&mut self, own: bool, status: u32) -> Vec<UplinkNotice> {
        if !own {
            return Vec::new();
        }

        let opened = self.color_opened;
        let closed = self.color_closed;
        self.led_expected = match status {
            1 => vec![opened, closed],
            2 => vec![opened, opened],
            _ => vec![closed, closed],
        };

        vec![UplinkNotice::RawRequest {
            url: format!(
                "{}?key={}&status={}",
                self.status_url, self.status_key, status
            ),
        }]
    }

    pub fn debug_state(&self) -> String {
        format!(
            "ch_init={} cssi={} leds={:?} applied={:?}",
            self.ch_init, self.cssi_done, self.led_expected, self.led_applied
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn switch() -> SwitchState {
        SwitchState::new(32, 16, 8, "http://example.invalid/door".into(), "k".into())
    }

    #[test]
    fn bringup_order() {
        let mut s = switch();
        let flags = Flags::default();

        let (cmd, _) = s.next_message(9, flags).unwrap();
        assert_eq!(
            cmd.as_line(),
            format!("cfg_sensor 9 0 {SWITCH_CHANNEL_ARGS}")
        );
        s.ch_init += 1;
        let (cmd, _) = s.next_message(9, flags).unwrap();
        assert!(cmd.as_line().starts_with("cfg_sensor 9 1"));
        s.ch_init += 1;

        let (cmd, pending) = s.next_message(9, flags).unwrap();
        assert_eq!(cmd.as_line(), "cfg_status_change_indicator 9 0,0,8 1,1,8");
        assert_eq!(pending, Pending::Indicator);
        s.cssi_done = true;

        let (cmd, pending) = s.next_message(9, flags).unwrap();
        assert_eq!(cmd.as_line(), "enable_sensor 9 3 500");
        assert_eq!(pending, Pending::Enable);
    }

    #[test]
    fn own_status_drives_leds_and_uplink() {
        let mut s = switch();
        let notices = s.on_peer_status(true, 1);
        assert_eq!(s.led_expected, vec![32, 16]);
        assert_eq!(
            notices,
            vec![UplinkNotice::RawRequest {
                url: "http://example.invalid/door?key=k&status=1".into()
            }]
        );

        s.on_peer_status(true, 2);
        assert_eq!(s.led_expected, vec![32, 32]);
        s.on_peer_status(true, 0);
        assert_eq!(s.led_expected, vec![16, 16]);
    }

    #[test]
    fn peer_status_is_ignored() {
        let mut s = switch();
        assert!(s.on_peer_status(false, 1).is_empty());
        assert_eq!(s.led_expected, vec![0, 0]);
    }
}
