//! Sensor-kind extension.
//!
//! A sensor node carries a list of measurement channels that must be
//! calibrated one by one before the sensors are enabled, plus an LED map that
//! mirrors the status of other nodes of interest onto its local LED bar.

use std::collections::HashMap;

use crate::node::{Flags, Pending};
use crate::protocol::Command;
use crate::uplink::UplinkNotice;

/// Calibration parameters of one measurement channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelConfig {
    /// Statistical state-estimation channel.
    Stat {
        index: u32,
        mid_adjustment_speed: i32,
        lowpass_weight: i32,
        frame_size: i32,
        /// Row-major square matrix, diagonal included (it is omitted on the
        /// wire, the firmware pins it to zero).
        transition_matrix: Vec<i32>,
        window_sizes: Vec<u32>,
        reject_threshold: i32,
        reject_consec_count: i32,
    },
    /// Frequency-domain channel.
    Freq {
        index: u32,
        threshold: i32,
        window: u32,
        max_neg: u32,
    },
}

impl ChannelConfig {
    pub fn index(&self) -> u32 {
        match self {
            ChannelConfig::Stat { index, .. } | ChannelConfig::Freq { index, .. } => *index,
        }
    }

    /// Calibration command for this channel.
    pub fn command(&self, node_id: u32) -> Command {
        match self {
            ChannelConfig::Stat {
                index,
                mid_adjustment_speed,
                lowpass_weight,
                frame_size,
                transition_matrix,
                window_sizes,
                reject_threshold,
                reject_consec_count,
            } => {
                let input_filter =
                    format!("{mid_adjustment_speed},{lowpass_weight},{frame_size}");
                let dim = (transition_matrix.len() as f64).sqrt() as usize;
                let mut cells = Vec::with_capacity(dim * dim.saturating_sub(1));
                for row in 0..dim {
                    for col in 0..dim {
                        if row != col {
                            cells.push(transition_matrix[row * dim + col].to_string());
                        }
                    }
                }
                let matrix = cells.join(",");
                let windows = window_sizes
                    .iter()
                    .map(|w| w.to_string())
                    .collect::<Vec<_>>()
                    .join(",");
                let reject = format!("{reject_threshold},{reject_consec_count}");
                Command::node_with_args(
                    node_id,
                    "cfg_sensor",
                    format_args!("{index} {input_filter} {matrix} {windows} {reject}"),
                )
            }
            ChannelConfig::Freq {
                index,
                threshold,
                window,
                max_neg,
            } => Command::node_with_args(
                node_id,
                "cfg_freq_chn",
                format_args!("{index} {threshold} {window} {max_neg}"),
            ),
        }
    }
}

/// One slot of the LED map: where a peer's status lands on the local bar and
/// which colour each status code maps to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedMapEntry {
    pub index: usize,
    /// Status code to colour. Codes without an entry leave the LED alone.
    pub colors: HashMap<u32, u32>,
}

#[derive(Debug, Clone)]
pub struct SensorState {
    pub channels: Vec<ChannelConfig>,
    pub channel_mask: u32,
    pub samplerate: u32,
    /// Peer node name to LED slot.
    pub ledmap: HashMap<String, LedMapEntry>,
    /// Next channel to calibrate.
    pub ch_init: usize,
    pub led_expected: Vec<u32>,
    pub led_applied: Option<Vec<u32>>,
    led_slots: usize,
}

impl SensorState {
    pub fn new(
        channels: Vec<ChannelConfig>,
        channel_mask: u32,
        samplerate: u32,
        ledmap: HashMap<String, LedMapEntry>,
    ) -> Self {
        let led_slots = ledmap.values().map(|e| e.index + 1).max().unwrap_or(0);
        SensorState {
            channels,
            channel_mask,
            samplerate,
            ledmap,
            ch_init: 0,
            led_expected: vec![0; led_slots],
            led_applied: None,
            led_slots,
        }
    }

    pub fn reset_runtime(&mut self) {
        self.ch_init = 0;
        self.led_expected = vec![0; self.led_slots];
        self.led_applied = None;
    }

    /// Fresh session on the node: the device lost its configuration.
    pub fn reset_init(&mut self) {
        self.ch_init = 0;
        self.led_applied = None;
    }

    pub fn next_message(&self, id: u32, flags: Flags) -> Option<(Command, Pending)> {
        if let Some(channel) = self.channels.get(self.ch_init) {
            return Some((channel.command(id), Pending::Channel));
        }

        if !flags.init_done {
            let cmd = Command::node_with_args(
                id,
                "enable_sensor",
                format_args!("{} {}", self.channel_mask, self.samplerate),
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

    pub fn on_peer_status(
        &mut self,
        own_name: &str,
        peer: &str,
        own: bool,
        status: u32,
    ) -> Vec<UplinkNotice> {
        let mut notices = Vec::new();
        if own {
            notices.push(UplinkNotice::StatusChange {
                node: own_name.to_string(),
                status,
            });
        }
        if let Some(entry) = self.ledmap.get(peer) {
            if let Some(&colour) = entry.colors.get(&status) {
                if let Some(slot) = self.led_expected.get_mut(entry.index) {
                    *slot = colour;
                }
            }
        }
        notices
    }

    pub fn debug_state(&self) -> String {
        format!(
            "ch_init={} leds={:?} applied={:?} last_mask={:#x}",
            self.ch_init, self.led_expected, self.led_applied, self.channel_mask
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stat_channel() -> ChannelConfig {
        ChannelConfig::Stat {
            index: 0,
            mid_adjustment_speed: 1,
            lowpass_weight: 10,
            frame_size: 100,
            transition_matrix: vec![0, 16500, -16000, 0],
            window_sizes: vec![3, 3, 3, 3],
            reject_threshold: 1,
            reject_consec_count: 1,
        }
    }

    #[test]
    fn stat_channel_omits_matrix_diagonal() {
        let cmd = stat_channel().command(2);
        assert_eq!(cmd.as_line(), "cfg_sensor 2 0 1,10,100 16500,-16000 3,3,3,3 1,1");
    }

    #[test]
    fn freq_channel_command() {
        let ch = ChannelConfig::Freq {
            index: 1,
            threshold: 100,
            window: 10,
            max_neg: 3,
        };
        assert_eq!(ch.command(2).as_line(), "cfg_freq_chn 2 1 100 10 3");
    }

    #[test]
    fn calibrates_then_enables_then_leds() {
        let mut ledmap = HashMap::new();
        ledmap.insert(
            "PEER".to_string(),
            LedMapEntry {
                index: 0,
                colors: HashMap::from([(1, 16)]),
            },
        );
        let mut s = SensorState::new(vec![stat_channel()], 1, 100, ledmap);
        let flags = Flags::default();

        let (cmd, pending) = s.next_message(2, flags).unwrap();
        assert!(cmd.as_line().starts_with("cfg_sensor 2 0"));
        assert_eq!(pending, Pending::Channel);
        s.ch_init += 1;

        let (cmd, pending) = s.next_message(2, flags).unwrap();
        assert_eq!(cmd.as_line(), "enable_sensor 2 1 100");
        assert_eq!(pending, Pending::Enable);

        let done = Flags {
            init_done: true,
            ..Flags::default()
        };
        // Initial LED vector is pushed once, then the state is converged.
        let (cmd, pending) = s.next_message(2, done).unwrap();
        assert_eq!(cmd.as_line(), "led 2 0");
        assert_eq!(pending, Pending::Led(vec![0]));
        s.led_applied = Some(vec![0]);
        assert!(s.next_message(2, done).is_none());
    }

    #[test]
    fn peer_status_updates_led_mirror() {
        let mut ledmap = HashMap::new();
        ledmap.insert(
            "PEER".to_string(),
            LedMapEntry {
                index: 1,
                colors: HashMap::from([(1, 16), (2, 32)]),
            },
        );
        let mut s = SensorState::new(Vec::new(), 0, 100, ledmap);
        assert_eq!(s.led_expected, vec![0, 0]);

        assert!(s.on_peer_status("ME", "PEER", false, 1).is_empty());
        assert_eq!(s.led_expected, vec![0, 16]);

        // Unknown status code leaves the LED alone.
        s.on_peer_status("ME", "PEER", false, 9);
        assert_eq!(s.led_expected, vec![0, 16]);

        // Unknown peer is ignored.
        s.on_peer_status("ME", "NOBODY", false, 2);
        assert_eq!(s.led_expected, vec![0, 16]);
    }

    #[test]
    fn own_status_notifies_uplink() {
        let mut s = SensorState::new(Vec::new(), 0, 100, HashMap::new());
        let notices = s.on_peer_status("ME", "ME", true, 2);
        assert_eq!(
            notices,
            vec![UplinkNotice::StatusChange {
                node: "ME".into(),
                status: 2
            }]
        );
    }
}
