use std::fmt;

/// DAQ components own blocks of 1000 source ids starting at these bases
const SOURCE_NAMES: [(&str, i32); 13] = [
    ("domHub", 1000),
    ("stringProc", 2000),
    ("iceTopDH", 3000),
    ("inIceTrig", 4000),
    ("iceTopTrig", 5000),
    ("glblTrig", 6000),
    ("evtBldr", 7000),
    ("tcalBldr", 8000),
    ("moniBldr", 9000),
    ("amandaTrig", 10000),
    ("snBldr", 11000),
    ("stringHub", 12000),
    ("simHub", 13000),
];

/// A DAQ source id, displayed as `name` or `name#n`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceId(pub i32);

impl SourceId {
    /// Component name and instance number
    pub fn parts(&self) -> (&'static str, i32) {
        if let Some((name, base)) = SOURCE_NAMES
            .iter()
            .find(|(_, base)| self.0 >= *base && self.0 < base + 1000)
        {
            return (*name, self.0 - *base);
        }
        // -1 is the wildcard used by trigger requests
        if self.0 == -1 {
            ("any", 0)
        } else {
            ("unknown", self.0)
        }
    }

    /// The component block, i.e. srcid / 1000
    pub fn component(&self) -> i32 {
        self.0 / 1000
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (name, num) = self.parts();
        if num == 0 {
            write!(f, "{name}")
        } else {
            write!(f, "{name}#{num}")
        }
    }
}
