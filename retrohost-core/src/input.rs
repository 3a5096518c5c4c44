//! Input state answered to the core's `input_state` polls.

use crate::ffi::{RETRO_DEVICE_JOYPAD, RETRO_DEVICE_KEYBOARD};

/// Number of `RETROK_*` key codes tracked.
pub const KEY_COUNT: usize = 512;

/// Ports with a joypad attached.
pub const MAX_PORTS: usize = 2;

/// libretro joypad button ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoypadButton {
    B = 0,
    Y = 1,
    Select = 2,
    Start = 3,
    Up = 4,
    Down = 5,
    Left = 6,
    Right = 7,
    A = 8,
    X = 9,
    L = 10,
    R = 11,
    L2 = 12,
    R2 = 13,
    L3 = 14,
    R3 = 15,
}

impl JoypadButton {
    /// Parse a button name as typed on the command line.
    pub fn from_name(name: &str) -> Option<Self> {
        let button = match name.to_ascii_lowercase().as_str() {
            "b" => Self::B,
            "y" => Self::Y,
            "select" => Self::Select,
            "start" => Self::Start,
            "up" => Self::Up,
            "down" => Self::Down,
            "left" => Self::Left,
            "right" => Self::Right,
            "a" => Self::A,
            "x" => Self::X,
            "l" => Self::L,
            "r" => Self::R,
            "l2" => Self::L2,
            "r2" => Self::R2,
            "l3" => Self::L3,
            "r3" => Self::R3,
            _ => return None,
        };
        Some(button)
    }
}

/// Keyboard and joypad state for one session.
#[derive(Debug, Clone)]
pub struct InputState {
    keys: Vec<bool>,
    joypads: [u16; MAX_PORTS],
}

impl Default for InputState {
    fn default() -> Self {
        Self {
            keys: vec![false; KEY_COUNT],
            joypads: [0; MAX_PORTS],
        }
    }
}

impl InputState {
    /// Press or release a `RETROK_*` key. Out-of-range codes are ignored.
    pub fn set_key(&mut self, code: usize, pressed: bool) {
        if let Some(key) = self.keys.get_mut(code) {
            *key = pressed;
        }
    }

    /// Press or release a joypad button on `port`.
    pub fn set_button(&mut self, port: usize, button: JoypadButton, pressed: bool) {
        if let Some(mask) = self.joypads.get_mut(port) {
            let bit = 1u16 << button as u16;
            if pressed {
                *mask |= bit;
            } else {
                *mask &= !bit;
            }
        }
    }

    pub fn release_all(&mut self) {
        self.keys.iter_mut().for_each(|k| *k = false);
        self.joypads = [0; MAX_PORTS];
    }

    /// Answer an `input_state` poll.
    pub fn state(&self, port: u32, device: u32, _index: u32, id: u32) -> i16 {
        match device {
            RETRO_DEVICE_JOYPAD => self
                .joypads
                .get(port as usize)
                .filter(|_| id < 16)
                .map_or(0, |mask| i16::from(mask & (1 << id) != 0)),
            RETRO_DEVICE_KEYBOARD => self
                .keys
                .get(id as usize)
                .map_or(0, |&pressed| i16::from(pressed)),
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_joypad_buttons() {
        let mut input = InputState::default();
        input.set_button(0, JoypadButton::Start, true);
        assert_eq!(input.state(0, RETRO_DEVICE_JOYPAD, 0, JoypadButton::Start as u32), 1);
        assert_eq!(input.state(0, RETRO_DEVICE_JOYPAD, 0, JoypadButton::A as u32), 0);
        assert_eq!(input.state(1, RETRO_DEVICE_JOYPAD, 0, JoypadButton::Start as u32), 0);

        input.set_button(0, JoypadButton::Start, false);
        assert_eq!(input.state(0, RETRO_DEVICE_JOYPAD, 0, JoypadButton::Start as u32), 0);
    }

    #[test]
    fn test_keyboard_keys() {
        let mut input = InputState::default();
        input.set_key(32, true);
        input.set_key(9999, true);
        assert_eq!(input.state(0, RETRO_DEVICE_KEYBOARD, 0, 32), 1);
        assert_eq!(input.state(0, RETRO_DEVICE_KEYBOARD, 0, 9999), 0);

        input.release_all();
        assert_eq!(input.state(0, RETRO_DEVICE_KEYBOARD, 0, 32), 0);
    }

    #[test]
    fn test_button_names() {
        assert_eq!(JoypadButton::from_name("START"), Some(JoypadButton::Start));
        assert_eq!(JoypadButton::from_name("l2"), Some(JoypadButton::L2));
        assert_eq!(JoypadButton::from_name("turbo"), None);
    }
}
