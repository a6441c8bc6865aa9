/// Where a (table, file) pair got to in its last load.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize)]
pub enum State {
    Started,
    Loaded,
}

impl State {
    pub fn as_str(&self) -> &str {
        match self {
            State::Started => "Started",
            State::Loaded => "Loaded",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "started" => Some(State::Started),
            "loaded" => Some(State::Loaded),
            _ => None,
        }
    }
}
