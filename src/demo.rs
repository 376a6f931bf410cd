//! Demo tasks used by the `forkpool` binary.

use std::time::Duration;

use anyhow::bail;
use clap::ValueEnum;

use forkpool::{KindRegistry, Task};

/// Demo task kinds selectable on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DemoKind {
    /// Multiply the input by two.
    Double,
    /// Sleep for the spin duration, then double.
    Spin,
    /// Fail on odd inputs, double even ones.
    FailOdd,
}

impl DemoKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Double => "double",
            Self::Spin => "spin",
            Self::FailOdd => "fail-odd",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::Double => "multiply the input by two",
            Self::Spin => "sleep for --spin-ms, then double",
            Self::FailOdd => "fail on odd inputs, double even ones",
        }
    }

    pub fn all() -> [DemoKind; 3] {
        [Self::Double, Self::Spin, Self::FailOdd]
    }
}

/// Integer task behind every demo kind.
#[derive(Debug, Clone)]
pub struct DemoTask {
    kind: DemoKind,
    spin: Duration,
}

impl DemoTask {
    pub fn new(kind: DemoKind, spin: Duration) -> Self {
        Self { kind, spin }
    }
}

impl Task for DemoTask {
    type Payload = i64;
    type Output = i64;

    fn run(&mut self, value: i64) -> anyhow::Result<i64> {
        match self.kind {
            DemoKind::Double => {}
            DemoKind::Spin => std::thread::sleep(self.spin),
            DemoKind::FailOdd => {
                if value % 2 != 0 {
                    bail!("odd input {}", value);
                }
            }
        }
        value
            .checked_mul(2)
            .ok_or_else(|| anyhow::anyhow!("{} overflows when doubled", value))
    }
}

/// Registry with every demo kind.
pub fn registry(spin: Duration) -> KindRegistry<DemoTask> {
    let mut registry = KindRegistry::new();
    for kind in DemoKind::all() {
        registry.register(kind.name(), move || DemoTask::new(kind, spin));
    }
    registry
}
