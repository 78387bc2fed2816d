use crate::error::TbError;
use crate::executor::{Sim, Wait};
use crate::sim_if::SignalId;
use crate::trigger::Trigger;
use crate::TaskResult;

/// A named signal of the simulated design, bound to the [`Sim`] it was looked up in.
#[derive(Clone)]
pub struct SimObject {
    id: SignalId,
    name: String,
    sim: Sim,
}

impl std::fmt::Debug for SimObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimObject")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

impl SimObject {
    pub(crate) fn new(id: SignalId, name: &str, sim: Sim) -> Self {
        Self {
            id,
            name: name.to_string(),
            sim,
        }
    }

    pub fn id(&self) -> SignalId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sim(&self) -> &Sim {
        &self.sim
    }

    /// Look up `<self>.<name>`.
    pub fn c(&self, name: &str) -> Result<SimObject, TbError> {
        self.sim.signal(&format!("{}.{}", self.name, name))
    }

    pub fn u64(&self) -> TaskResult<u64> {
        self.sim.read(self.id)
    }

    pub fn u32(&self) -> TaskResult<u32> {
        let value = self.u64()?;
        u32::try_from(value).map_err(|_| TbError::ValueOverflow {
            signal: self.name.clone(),
            value,
            bits: 32,
        })
    }

    pub fn set(&self, val: u64) -> TaskResult<()> {
        self.sim.write(self.id, val)
    }

    /// Deposit a binary string such as `"0b1010"` or `"1010_0001"`.
    pub fn set_bin(&self, val: &str) -> TaskResult<()> {
        let stripped = val.strip_prefix("0b").unwrap_or(val).replace('_', "");
        if stripped.is_empty() || stripped.len() > 64 {
            return Err(TbError::Failed(format!(
                "can't set {} to {}: length must be 1..=64 bits",
                self.name, val
            )));
        }
        let value = u64::from_str_radix(&stripped, 2).map_err(|_| {
            TbError::Failed(format!("can't set {} to {}: invalid characters", self.name, val))
        })?;
        self.set(value)
    }

    pub fn bin(&self, width: usize) -> TaskResult<String> {
        Ok(format!("{:0width$b}", self.u64()?, width = width))
    }

    // convenience functions to get edge triggers for this signal
    pub fn rising_edge(&self) -> Wait {
        self.sim.wait(Trigger::rising_edge(self.id))
    }
    pub fn falling_edge(&self) -> Wait {
        self.sim.wait(Trigger::falling_edge(self.id))
    }
    pub fn edge(&self) -> Wait {
        self.sim.wait(Trigger::edge(self.id))
    }
}
