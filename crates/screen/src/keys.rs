//! Keyboard input model

use sightline_common::{Error, Result};
use std::fmt;

/// Non-printable keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Key {
    Enter,
    Tab,
    Space,
    Escape,
    Backspace,
    Delete,
    Insert,
    Home,
    End,
    PageUp,
    PageDown,
    Up,
    Down,
    Left,
    Right,
    Ctrl,
    Alt,
    Shift,
    Meta,
    Super,
    /// Function key F1 to F12
    F(u8),
}

impl Key {
    /// Look a key up by one of its names, case-insensitively
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.to_ascii_lowercase();
        let key = match name.as_str() {
            "enter" | "return" => Key::Enter,
            "tab" => Key::Tab,
            "space" | "spacebar" => Key::Space,
            "esc" | "escape" => Key::Escape,
            "bsp" | "backspace" => Key::Backspace,
            "del" | "delete" => Key::Delete,
            "ins" | "insert" => Key::Insert,
            "home" => Key::Home,
            "end" => Key::End,
            "pgup" | "pageup" => Key::PageUp,
            "pgdn" | "pagedown" => Key::PageDown,
            "up" => Key::Up,
            "down" => Key::Down,
            "left" => Key::Left,
            "right" => Key::Right,
            "ctrl" | "control" => Key::Ctrl,
            "alt" => Key::Alt,
            "shift" => Key::Shift,
            "meta" => Key::Meta,
            "super" => Key::Super,
            other => {
                let n: u8 = other.strip_prefix('f')?.parse().ok()?;
                if !(1..=12).contains(&n) {
                    return None;
                }
                Key::F(n)
            }
        };
        Some(key)
    }

    /// Name understood by vncdo
    pub fn vnc_name(&self) -> String {
        match self {
            Key::Enter => "enter".into(),
            Key::Tab => "tab".into(),
            Key::Space => "space".into(),
            Key::Escape => "esc".into(),
            Key::Backspace => "bsp".into(),
            Key::Delete => "delete".into(),
            Key::Insert => "ins".into(),
            Key::Home => "home".into(),
            Key::End => "end".into(),
            Key::PageUp => "pgup".into(),
            Key::PageDown => "pgdn".into(),
            Key::Up => "up".into(),
            Key::Down => "down".into(),
            Key::Left => "left".into(),
            Key::Right => "right".into(),
            Key::Ctrl => "ctrl".into(),
            Key::Alt => "alt".into(),
            Key::Shift => "shift".into(),
            Key::Meta => "meta".into(),
            Key::Super => "super".into(),
            Key::F(n) => format!("f{}", n),
        }
    }

    /// `"<enter>"` style token naming a known key
    pub fn from_token(token: &str) -> Option<Self> {
        token
            .strip_prefix('<')
            .and_then(|t| t.strip_suffix('>'))
            .and_then(Key::from_name)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}>", self.vnc_name())
    }
}

/// One key of a press or combination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyCode {
    Key(Key),
    Char(char),
}

impl KeyCode {
    /// Key for a character of typed text
    pub fn for_char(c: char) -> Self {
        match c {
            '\n' | '\r' => KeyCode::Key(Key::Enter),
            '\t' => KeyCode::Key(Key::Tab),
            c => KeyCode::Char(c),
        }
    }
}

impl fmt::Display for KeyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyCode::Key(key) => key.fmt(f),
            KeyCode::Char(c) => write!(f, "{}", c),
        }
    }
}

/// What a script asks to type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyInput {
    /// Typed character by character
    Text(String),
    /// A single non-printable key
    Key(Key),
    /// Keys held together, modifiers first
    Combo { modifiers: Vec<Key>, last: KeyCode },
}

impl KeyInput {
    /// `"<enter>"` becomes a key; anything else, `"<foo>"` included, is text
    pub fn parse(token: &str) -> Self {
        match Key::from_token(token) {
            Some(key) => KeyInput::Key(key),
            None => KeyInput::Text(token.to_string()),
        }
    }

    /// A simultaneous combination such as `["<ctrl>", "<alt>", "<del>"]`
    ///
    /// Every token but the last must name a key; the last may be a key or a
    /// single character.
    pub fn combo<S: AsRef<str>>(tokens: &[S]) -> Result<Self> {
        let (last, modifiers) = tokens
            .split_last()
            .ok_or_else(|| Error::usage("key combination is empty"))?;

        let modifiers = modifiers
            .iter()
            .map(|token| {
                Key::from_token(token.as_ref()).ok_or_else(|| {
                    Error::usage(format!(
                        "'{}' in a key combination is not a special key",
                        token.as_ref()
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let last = last.as_ref();
        let last = match Key::from_token(last) {
            Some(key) => KeyCode::Key(key),
            None => {
                let mut chars = last.chars();
                match (chars.next(), chars.next()) {
                    (Some(c), None) => KeyCode::Char(c),
                    _ => {
                        return Err(Error::usage(format!(
                            "last element '{}' of a key combination must be a special key or one character",
                            last
                        )))
                    }
                }
            }
        };

        Ok(KeyInput::Combo { modifiers, last })
    }

    /// Key presses this input expands to, one entry per press
    pub fn presses(&self) -> Vec<Vec<KeyCode>> {
        match self {
            KeyInput::Text(text) => text.chars().map(|c| vec![KeyCode::for_char(c)]).collect(),
            KeyInput::Key(key) => vec![vec![KeyCode::Key(*key)]],
            KeyInput::Combo { modifiers, last } => {
                let mut keys: Vec<KeyCode> = modifiers.iter().copied().map(KeyCode::Key).collect();
                keys.push(*last);
                vec![keys]
            }
        }
    }
}

impl From<&str> for KeyInput {
    fn from(token: &str) -> Self {
        KeyInput::parse(token)
    }
}

impl From<Key> for KeyInput {
    fn from(key: Key) -> Self {
        KeyInput::Key(key)
    }
}
