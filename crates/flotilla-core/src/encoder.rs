//! Reserved-character encoding between logical and backend-native names.
//!
//! Each backend enables a bitmask of rules describing which characters its
//! native namespace cannot store. Enabled characters are mapped to their
//! Unicode fullwidth equivalents (`/` → `／`, `:` → `：`) or, for control
//! characters, to the U+2400 "control picture" block. Edge rules encode a
//! leading/trailing space, period, tilde or CR/LF/HT/VT that many stores
//! silently strip.
//!
//! When an input already contains one of the replacement runes it is
//! prefixed with [`QUOTE_RUNE`] so that decoding is unambiguous: for any
//! string, `decode(encode(s)) == s`.

/// Prefix marking the next rune as literal.
pub const QUOTE_RUNE: char = '‛';

/// A bitmask of encoding rules.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Encoding(u32);

macro_rules! rules {
    ($($name:ident = $bit:expr;)+) => {
        impl Encoding {
            $(pub const $name: Encoding = Encoding(1 << $bit);)+
        }
    };
}

rules! {
    ZERO = 0;
    SLASH = 1;
    SINGLE_QUOTE = 2;
    BACK_QUOTE = 3;
    DOUBLE_QUOTE = 4;
    LT_GT = 5;
    SQUARE_BRACKET = 6;
    SEMICOLON = 7;
    DOLLAR = 8;
    COLON = 9;
    QUESTION = 10;
    ASTERISK = 11;
    PIPE = 12;
    HASH = 13;
    PERCENT = 14;
    BACK_SLASH = 15;
    CR_LF = 16;
    DEL = 17;
    CTL = 18;
    LEFT_SPACE = 19;
    LEFT_PERIOD = 20;
    LEFT_TILDE = 21;
    LEFT_CR_LF_HT_VT = 22;
    RIGHT_SPACE = 23;
    RIGHT_PERIOD = 24;
    RIGHT_CR_LF_HT_VT = 25;
    DOT = 26;
}

impl Encoding {
    /// No rules: encode and decode are the identity.
    pub const NONE: Encoding = Encoding(0);

    /// The default rule set for hierarchical stores: NUL, slash and control
    /// characters plus the `.`/`..` names.
    pub fn standard() -> Encoding {
        Encoding::ZERO | Encoding::SLASH | Encoding::CTL | Encoding::DEL | Encoding::DOT
    }

    pub const fn contains(self, rule: Encoding) -> bool {
        self.0 & rule.0 != 0
    }

    pub const fn union(self, other: Encoding) -> Encoding {
        Encoding(self.0 | other.0)
    }

    /// Map a character under the enabled body rules.
    fn forward(self, c: char) -> Option<char> {
        let mapped = match c {
            '\0' if self.contains(Encoding::ZERO) => '␀',
            '/' if self.contains(Encoding::SLASH) => '／',
            '\'' if self.contains(Encoding::SINGLE_QUOTE) => '＇',
            '`' if self.contains(Encoding::BACK_QUOTE) => '｀',
            '"' if self.contains(Encoding::DOUBLE_QUOTE) => '＂',
            '<' if self.contains(Encoding::LT_GT) => '＜',
            '>' if self.contains(Encoding::LT_GT) => '＞',
            '[' if self.contains(Encoding::SQUARE_BRACKET) => '［',
            ']' if self.contains(Encoding::SQUARE_BRACKET) => '］',
            ';' if self.contains(Encoding::SEMICOLON) => '；',
            '$' if self.contains(Encoding::DOLLAR) => '＄',
            ':' if self.contains(Encoding::COLON) => '：',
            '?' if self.contains(Encoding::QUESTION) => '？',
            '*' if self.contains(Encoding::ASTERISK) => '＊',
            '|' if self.contains(Encoding::PIPE) => '｜',
            '#' if self.contains(Encoding::HASH) => '＃',
            '%' if self.contains(Encoding::PERCENT) => '％',
            '\\' if self.contains(Encoding::BACK_SLASH) => '＼',
            '\r' if self.contains(Encoding::CR_LF) => '␍',
            '\n' if self.contains(Encoding::CR_LF) => '␊',
            '\x7f' if self.contains(Encoding::DEL) => '␡',
            c @ '\x01'..='\x1f' if self.contains(Encoding::CTL) => {
                char::from_u32(0x2400 + c as u32).expect("control picture")
            }
            _ => return None,
        };
        Some(mapped)
    }

    /// Invert [`Encoding::forward`] for the enabled rules.
    fn backward(self, c: char) -> Option<char> {
        let orig = match c {
            '␀' if self.contains(Encoding::ZERO) => '\0',
            '／' if self.contains(Encoding::SLASH) => '/',
            '＇' if self.contains(Encoding::SINGLE_QUOTE) => '\'',
            '｀' if self.contains(Encoding::BACK_QUOTE) => '`',
            '＂' if self.contains(Encoding::DOUBLE_QUOTE) => '"',
            '＜' if self.contains(Encoding::LT_GT) => '<',
            '＞' if self.contains(Encoding::LT_GT) => '>',
            '［' if self.contains(Encoding::SQUARE_BRACKET) => '[',
            '］' if self.contains(Encoding::SQUARE_BRACKET) => ']',
            '；' if self.contains(Encoding::SEMICOLON) => ';',
            '＄' if self.contains(Encoding::DOLLAR) => '$',
            '：' if self.contains(Encoding::COLON) => ':',
            '？' if self.contains(Encoding::QUESTION) => '?',
            '＊' if self.contains(Encoding::ASTERISK) => '*',
            '｜' if self.contains(Encoding::PIPE) => '|',
            '＃' if self.contains(Encoding::HASH) => '#',
            '％' if self.contains(Encoding::PERCENT) => '%',
            '＼' if self.contains(Encoding::BACK_SLASH) => '\\',
            '␍' if self.contains(Encoding::CR_LF) => '\r',
            '␊' if self.contains(Encoding::CR_LF) => '\n',
            '␡' if self.contains(Encoding::DEL) => '\x7f',
            c @ '␁'..='␟' if self.contains(Encoding::CTL) => {
                char::from_u32(c as u32 - 0x2400).expect("control char")
            }
            _ => return None,
        };
        Some(orig)
    }

    /// Map a character under the enabled edge rules for the given position.
    fn edge(self, c: char, leading: bool, trailing: bool) -> Option<char> {
        if leading {
            match c {
                ' ' if self.contains(Encoding::LEFT_SPACE) => return Some('␠'),
                '.' if self.contains(Encoding::LEFT_PERIOD) => return Some('．'),
                '~' if self.contains(Encoding::LEFT_TILDE) => return Some('～'),
                '\t' | '\n' | '\x0b' | '\r' if self.contains(Encoding::LEFT_CR_LF_HT_VT) => {
                    return char::from_u32(0x2400 + c as u32);
                }
                _ => {}
            }
        }
        if trailing {
            match c {
                ' ' if self.contains(Encoding::RIGHT_SPACE) => return Some('␠'),
                '.' if self.contains(Encoding::RIGHT_PERIOD) => return Some('．'),
                '\t' | '\n' | '\x0b' | '\r' if self.contains(Encoding::RIGHT_CR_LF_HT_VT) => {
                    return char::from_u32(0x2400 + c as u32);
                }
                _ => {}
            }
        }
        None
    }

    /// Invert [`Encoding::edge`].
    fn edge_back(self, c: char, leading: bool, trailing: bool) -> Option<char> {
        if leading {
            match c {
                '␠' if self.contains(Encoding::LEFT_SPACE) => return Some(' '),
                '．' if self.contains(Encoding::LEFT_PERIOD) => return Some('.'),
                '～' if self.contains(Encoding::LEFT_TILDE) => return Some('~'),
                '␉' | '␊' | '␋' | '␍' if self.contains(Encoding::LEFT_CR_LF_HT_VT) => {
                    return char::from_u32(c as u32 - 0x2400);
                }
                _ => {}
            }
        }
        if trailing {
            match c {
                '␠' if self.contains(Encoding::RIGHT_SPACE) => return Some(' '),
                '．' if self.contains(Encoding::RIGHT_PERIOD) => return Some('.'),
                '␉' | '␊' | '␋' | '␍' if self.contains(Encoding::RIGHT_CR_LF_HT_VT) => {
                    return char::from_u32(c as u32 - 0x2400);
                }
                _ => {}
            }
        }
        None
    }

    /// Whether `c` is a replacement rune any enabled rule could produce, and
    /// therefore needs quoting when it appears literally.
    fn is_replacement(self, c: char) -> bool {
        self.backward(c).is_some()
            || self.edge_back(c, true, true).is_some()
            || (self.contains(Encoding::DOT) && c == '．')
    }

    /// Encode a logical name into its backend-native form.
    pub fn encode(self, s: &str) -> String {
        if self == Encoding::NONE || s.is_empty() {
            return s.to_string();
        }

        // Whole-name rule: `.` and `..` have meaning to hierarchical stores.
        if self.contains(Encoding::DOT) {
            if s == "." {
                return "．".to_string();
            }
            if s == ".." {
                return "．．".to_string();
            }
        }

        let chars: Vec<char> = s.chars().collect();
        let last = chars.len() - 1;
        let mut out = String::with_capacity(s.len());
        for (i, &c) in chars.iter().enumerate() {
            if c == QUOTE_RUNE || self.is_replacement(c) {
                out.push(QUOTE_RUNE);
                out.push(c);
            } else if let Some(r) = self.edge(c, i == 0, i == last) {
                out.push(r);
            } else if let Some(r) = self.forward(c) {
                out.push(r);
            } else {
                out.push(c);
            }
        }
        out
    }

    /// Decode a backend-native name back into its logical form.
    pub fn decode(self, s: &str) -> String {
        if self == Encoding::NONE || s.is_empty() {
            return s.to_string();
        }

        if self.contains(Encoding::DOT) {
            if s == "．" {
                return ".".to_string();
            }
            if s == "．．" {
                return "..".to_string();
            }
        }

        let chars: Vec<char> = s.chars().collect();
        let last = chars.len() - 1;
        let mut out = String::with_capacity(s.len());
        let mut quoted = false;
        for (i, &c) in chars.iter().enumerate() {
            if quoted {
                out.push(c);
                quoted = false;
            } else if c == QUOTE_RUNE {
                quoted = true;
            } else if let Some(orig) = self.edge_back(c, i == 0, i == last) {
                out.push(orig);
            } else if let Some(orig) = self.backward(c) {
                out.push(orig);
            } else {
                out.push(c);
            }
        }
        // A dangling quote decodes to itself rather than vanishing.
        if quoted {
            out.push(QUOTE_RUNE);
        }
        out
    }
}

impl std::ops::BitOr for Encoding {
    type Output = Encoding;

    fn bitor(self, rhs: Encoding) -> Encoding {
        self.union(rhs)
    }
}
