use serde::Serialize;
use std::fmt;

/// A single native stack frame, resolved to a symbol on a best effort basis
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Frame {
    /// The address was resolved to a symbol in a loaded module
    Resolved {
        /// The instruction address of the frame
        address: u64,
        /// The file name of the module (shared object, dylib, executable)
        /// containing the symbol
        module: String,
        /// The (demangled, if possible) symbol name
        symbol: String,
        /// The offset of `address` from the start of `symbol`
        offset: u64,
    },
    /// No symbol could be found for the address. The module is still
    /// recorded if the address falls within one.
    Unresolved {
        address: u64,
        module: Option<String>,
    },
}

impl Frame {
    /// The instruction address of the frame
    #[inline]
    pub fn address(&self) -> u64 {
        match self {
            Self::Resolved { address, .. } | Self::Unresolved { address, .. } => *address,
        }
    }

    /// The file name of the module containing the address, if known
    #[inline]
    pub fn module(&self) -> Option<&str> {
        match self {
            Self::Resolved { module, .. } => Some(module),
            Self::Unresolved { module, .. } => module.as_deref(),
        }
    }

    /// The symbol name, only available for [`Self::Resolved`] frames
    #[inline]
    pub fn symbol(&self) -> Option<&str> {
        match self {
            Self::Resolved { symbol, .. } => Some(symbol),
            Self::Unresolved { .. } => None,
        }
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Resolved {
                address,
                module,
                symbol,
                offset,
            } => write!(f, "0x{address:x} {module}!{symbol}+0x{offset:x}"),
            Self::Unresolved {
                address,
                module: Some(module),
            } => write!(f, "0x{address:x} {module}!0x{address:x}"),
            Self::Unresolved {
                address,
                module: None,
            } => write!(f, "0x{address:x}"),
        }
    }
}

#[cfg(test)]
mod test {
    use super::Frame;

    #[test]
    fn renders_resolved() {
        let frame = Frame::Resolved {
            address: 0x1000_4f20,
            module: "libobjc.A.dylib".to_owned(),
            symbol: "objc_exception_throw".to_owned(),
            offset: 0x30,
        };

        assert_eq!(
            frame.to_string(),
            "0x10004f20 libobjc.A.dylib!objc_exception_throw+0x30"
        );
        assert_eq!(frame.module(), Some("libobjc.A.dylib"));
        assert_eq!(frame.symbol(), Some("objc_exception_throw"));
    }

    #[test]
    fn renders_unresolved() {
        let in_module = Frame::Unresolved {
            address: 0xdead,
            module: Some("libfoo.so".to_owned()),
        };
        assert_eq!(in_module.to_string(), "0xdead libfoo.so!0xdead");
        assert_eq!(in_module.symbol(), None);

        let nowhere = Frame::Unresolved {
            address: 0xdead,
            module: None,
        };
        assert_eq!(nowhere.to_string(), "0xdead");
        assert_eq!(nowhere.module(), None);
        assert_eq!(nowhere.address(), 0xdead);
    }
}
