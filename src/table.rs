//! # Register Table
//!
//! The addressable state of a Modbus device: four independent spaces, each
//! addressed `0..capacity`.
//!
//! | Space | Value | Client access |
//! |-------|-------|---------------|
//! | Coils | bool | read/write |
//! | Discrete Inputs | bool | read only |
//! | Holding Registers | u16 | read/write |
//! | Input Registers | u16 | read only |
//!
//! Every access is validated before anything is written, so a rejected
//! ranged write leaves the table exactly as it was.
//!
//! ## Example
//!
//! ```rust
//! use modbus_node::table::{RegisterTable, WordSpace};
//!
//! let mut table = RegisterTable::new(0, 0, 10, 0).unwrap();
//! table.set_register(WordSpace::HoldingRegisters, 5, 0x1234).unwrap();
//! assert_eq!(table.get_registers(WordSpace::HoldingRegisters, 5, 1).unwrap(), vec![0x1234]);
//! assert!(table.get_registers(WordSpace::HoldingRegisters, 5, 6).is_err());
//! ```

use std::fmt;
use std::sync::{Arc, RwLock};

use tracing::debug;

use crate::constants::MAX_TABLE_CAPACITY;
use crate::error::{ModbusError, ModbusResult};

/// Any of the four address spaces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Space {
    Coils,
    DiscreteInputs,
    HoldingRegisters,
    InputRegisters,
}

impl fmt::Display for Space {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Space::Coils => "coils",
            Space::DiscreteInputs => "discrete inputs",
            Space::HoldingRegisters => "holding registers",
            Space::InputRegisters => "input registers",
        };
        f.write_str(name)
    }
}

/// Boolean spaces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BitSpace {
    Coils,
    DiscreteInputs,
}

impl From<BitSpace> for Space {
    fn from(space: BitSpace) -> Self {
        match space {
            BitSpace::Coils => Space::Coils,
            BitSpace::DiscreteInputs => Space::DiscreteInputs,
        }
    }
}

/// 16-bit register spaces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WordSpace {
    HoldingRegisters,
    InputRegisters,
}

impl From<WordSpace> for Space {
    fn from(space: WordSpace) -> Self {
        match space {
            WordSpace::HoldingRegisters => Space::HoldingRegisters,
            WordSpace::InputRegisters => Space::InputRegisters,
        }
    }
}

/// One contiguous space of values with a fixed capacity.
#[derive(Debug, Clone)]
struct Bank<T> {
    space: Space,
    values: Vec<T>,
    /// Bumped on every successful mutation
    revision: u64,
}

impl<T: Copy + Default> Bank<T> {
    fn new(space: Space, capacity: usize) -> ModbusResult<Self> {
        check_capacity(space, capacity)?;
        Ok(Self {
            space,
            values: vec![T::default(); capacity],
            revision: 0,
        })
    }

    fn capacity(&self) -> usize {
        self.values.len()
    }

    fn check(&self, address: usize, count: usize) -> ModbusResult<()> {
        match address.checked_add(count) {
            Some(end) if end <= self.values.len() => Ok(()),
            _ => Err(ModbusError::OutOfRange {
                space: self.space,
                address,
                count,
                capacity: self.values.len(),
            }),
        }
    }

    fn get(&self, address: usize) -> ModbusResult<T> {
        self.check(address, 1)?;
        Ok(self.values[address])
    }

    fn set(&mut self, address: usize, value: T) -> ModbusResult<()> {
        self.check(address, 1)?;
        self.values[address] = value;
        self.revision += 1;
        Ok(())
    }

    fn range(&self, address: usize, count: usize) -> ModbusResult<Vec<T>> {
        self.check(address, count)?;
        Ok(self.values[address..address + count].to_vec())
    }

    fn write(&mut self, address: usize, values: &[T]) -> ModbusResult<()> {
        self.check(address, values.len())?;
        self.values[address..address + values.len()].copy_from_slice(values);
        self.revision += 1;
        Ok(())
    }

    fn resize(&mut self, capacity: usize) -> ModbusResult<()> {
        check_capacity(self.space, capacity)?;
        debug!(
            "Resizing {}: {} -> {} entries",
            self.space,
            self.values.len(),
            capacity
        );
        self.values.resize(capacity, T::default());
        self.revision += 1;
        Ok(())
    }

    fn append(&mut self, values: &[T]) -> ModbusResult<()> {
        let capacity = self.values.len().saturating_add(values.len());
        check_capacity(self.space, capacity)?;
        self.values.extend_from_slice(values);
        self.revision += 1;
        Ok(())
    }
}

fn check_capacity(space: Space, capacity: usize) -> ModbusResult<()> {
    if capacity > MAX_TABLE_CAPACITY {
        return Err(ModbusError::invalid_argument(format!(
            "{} capacity {} exceeds maximum {}",
            space, capacity, MAX_TABLE_CAPACITY
        )));
    }
    Ok(())
}

/// Register/coil store of one device (server) or of one remote view (client).
#[derive(Debug, Clone)]
pub struct RegisterTable {
    coils: Bank<bool>,
    discrete_inputs: Bank<bool>,
    holding_registers: Bank<u16>,
    input_registers: Bank<u16>,
}

impl Default for RegisterTable {
    fn default() -> Self {
        Self {
            coils: Bank::empty(Space::Coils),
            discrete_inputs: Bank::empty(Space::DiscreteInputs),
            holding_registers: Bank::empty(Space::HoldingRegisters),
            input_registers: Bank::empty(Space::InputRegisters),
        }
    }
}

impl<T> Bank<T> {
    fn empty(space: Space) -> Self {
        Self {
            space,
            values: Vec::new(),
            revision: 0,
        }
    }
}

impl RegisterTable {
    /// Create a table with the given capacities, all values zero/false.
    pub fn new(
        coils: usize,
        discrete_inputs: usize,
        holding_registers: usize,
        input_registers: usize,
    ) -> ModbusResult<Self> {
        Ok(Self {
            coils: Bank::new(Space::Coils, coils)?,
            discrete_inputs: Bank::new(Space::DiscreteInputs, discrete_inputs)?,
            holding_registers: Bank::new(Space::HoldingRegisters, holding_registers)?,
            input_registers: Bank::new(Space::InputRegisters, input_registers)?,
        })
    }

    fn bits(&self, space: BitSpace) -> &Bank<bool> {
        match space {
            BitSpace::Coils => &self.coils,
            BitSpace::DiscreteInputs => &self.discrete_inputs,
        }
    }

    fn bits_mut(&mut self, space: BitSpace) -> &mut Bank<bool> {
        match space {
            BitSpace::Coils => &mut self.coils,
            BitSpace::DiscreteInputs => &mut self.discrete_inputs,
        }
    }

    fn words(&self, space: WordSpace) -> &Bank<u16> {
        match space {
            WordSpace::HoldingRegisters => &self.holding_registers,
            WordSpace::InputRegisters => &self.input_registers,
        }
    }

    fn words_mut(&mut self, space: WordSpace) -> &mut Bank<u16> {
        match space {
            WordSpace::HoldingRegisters => &mut self.holding_registers,
            WordSpace::InputRegisters => &mut self.input_registers,
        }
    }

    /// Number of addressable entries in a space
    pub fn capacity(&self, space: Space) -> usize {
        match space {
            Space::Coils => self.coils.capacity(),
            Space::DiscreteInputs => self.discrete_inputs.capacity(),
            Space::HoldingRegisters => self.holding_registers.capacity(),
            Space::InputRegisters => self.input_registers.capacity(),
        }
    }

    /// Mutation counter of a space.
    ///
    /// Increases on every successful write, resize or append; unchanged by
    /// reads and by rejected writes.
    pub fn revision(&self, space: Space) -> u64 {
        match space {
            Space::Coils => self.coils.revision,
            Space::DiscreteInputs => self.discrete_inputs.revision,
            Space::HoldingRegisters => self.holding_registers.revision,
            Space::InputRegisters => self.input_registers.revision,
        }
    }

    // ===== Boolean spaces =====

    pub fn get_bit(&self, space: BitSpace, address: usize) -> ModbusResult<bool> {
        self.bits(space).get(address)
    }

    pub fn set_bit(&mut self, space: BitSpace, address: usize, value: bool) -> ModbusResult<()> {
        self.bits_mut(space).set(address, value)
    }

    pub fn get_bits(&self, space: BitSpace, address: usize, count: usize) -> ModbusResult<Vec<bool>> {
        self.bits(space).range(address, count)
    }

    /// Overwrite `values.len()` entries starting at `address`.
    pub fn set_bits(&mut self, space: BitSpace, address: usize, values: &[bool]) -> ModbusResult<()> {
        self.bits_mut(space).write(address, values)
    }

    /// Grow a boolean space by `values.len()` entries holding `values`.
    pub fn append_bits(&mut self, space: BitSpace, values: &[bool]) -> ModbusResult<()> {
        self.bits_mut(space).append(values)
    }

    // ===== Register spaces =====

    pub fn get_register(&self, space: WordSpace, address: usize) -> ModbusResult<u16> {
        self.words(space).get(address)
    }

    pub fn set_register(&mut self, space: WordSpace, address: usize, value: u16) -> ModbusResult<()> {
        self.words_mut(space).set(address, value)
    }

    pub fn get_registers(
        &self,
        space: WordSpace,
        address: usize,
        count: usize,
    ) -> ModbusResult<Vec<u16>> {
        self.words(space).range(address, count)
    }

    /// Overwrite `values.len()` registers starting at `address`.
    pub fn set_registers(
        &mut self,
        space: WordSpace,
        address: usize,
        values: &[u16],
    ) -> ModbusResult<()> {
        self.words_mut(space).write(address, values)
    }

    /// Grow a register space by `values.len()` entries holding `values`.
    pub fn append_registers(&mut self, space: WordSpace, values: &[u16]) -> ModbusResult<()> {
        self.words_mut(space).append(values)
    }

    // ===== Capacity =====

    /// Grow or shrink a space.
    ///
    /// Values at addresses below `min(old, new)` are kept, growth is
    /// zero-filled. Fails with `InvalidArgument` above 65535 entries.
    pub fn resize(&mut self, space: Space, capacity: usize) -> ModbusResult<()> {
        match space {
            Space::Coils => self.coils.resize(capacity),
            Space::DiscreteInputs => self.discrete_inputs.resize(capacity),
            Space::HoldingRegisters => self.holding_registers.resize(capacity),
            Space::InputRegisters => self.input_registers.resize(capacity),
        }
    }
}

/// Table shared by every connection of a server.
///
/// Reads take the shared lock and see a consistent snapshot of a range;
/// writes serialize behind the exclusive lock.
pub type SharedTable = Arc<RwLock<RegisterTable>>;

/// Wrap a table for sharing across connections
pub fn shared(table: RegisterTable) -> SharedTable {
    Arc::new(RwLock::new(table))
}
