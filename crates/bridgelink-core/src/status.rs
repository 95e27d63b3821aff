//! Test status shared by health checks and the pairing protocol

use serde::{Deserialize, Serialize};

/// Outcome of a check that may not have run yet
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    #[default]
    NotTested,
    Testing,
    TestGood,
    TestBad,
}

impl TestStatus {
    pub fn from_bool(good: bool) -> Self {
        if good {
            TestStatus::TestGood
        } else {
            TestStatus::TestBad
        }
    }
}

impl std::fmt::Display for TestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TestStatus::NotTested => "not tested",
            TestStatus::Testing => "testing",
            TestStatus::TestGood => "good",
            TestStatus::TestBad => "bad",
        };
        f.write_str(s)
    }
}
