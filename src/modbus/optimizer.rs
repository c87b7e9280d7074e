use crate::config::polling::RegisterConfig;

/// FC3/FC4 protocol ceiling: 125 registers per request.
pub const MAX_BLOCK_SIZE: u16 = 125;

/// Engineering-notation banks mapped onto zero-based protocol addresses.
/// Kept as a table so the bases stay adjustable in one place.
const ADDRESS_BANKS: &[(u16, u16)] = &[
    (40001, 49999), // holding registers
    (30001, 39999), // input registers
];

/// One coalesced Modbus read covering strictly contiguous addresses.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadBlock {
    pub start_address: u16,
    pub count: u16,
    pub registers: Vec<RegisterConfig>,
}

/// Group registers into contiguous read blocks of at most `max_block_size`.
/// Registers are sorted by address ascending; equal addresses keep their
/// input order. Empty in, empty out.
pub fn optimize(registers: &[RegisterConfig], max_block_size: u16) -> Vec<ReadBlock> {
    if registers.is_empty() {
        return Vec::new();
    }
    let max = max_block_size.max(1);

    let mut sorted: Vec<RegisterConfig> = registers.to_vec();
    sorted.sort_by_key(|register| register.address);

    let mut blocks: Vec<ReadBlock> = Vec::new();
    let mut current: Vec<RegisterConfig> = Vec::new();

    for register in sorted {
        let extends_current = current
            .last()
            .map(|last| register.address == last.address + 1)
            .unwrap_or(false);

        if !extends_current || current.len() as u16 >= max {
            if !current.is_empty() {
                blocks.push(block_from(current));
            }
            current = Vec::new();
        }
        current.push(register);
    }
    if !current.is_empty() {
        blocks.push(block_from(current));
    }
    blocks
}

fn block_from(registers: Vec<RegisterConfig>) -> ReadBlock {
    ReadBlock {
        start_address: registers[0].address,
        count: registers.len() as u16,
        registers,
    }
}

/// Map a 1-based engineering address onto the zero-based wire address.
/// `4xxxx` and `3xxxx` banks subtract their base; any other positive address
/// is treated as generic 1-based. Applied to block start addresses only.
pub fn normalize_address(address: u16) -> u16 {
    for &(base, end) in ADDRESS_BANKS {
        if (base..=end).contains(&address) {
            return address - base;
        }
    }
    if address > 0 {
        address - 1
    } else {
        address
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn register(id: &str, address: u16) -> RegisterConfig {
        RegisterConfig {
            register_id: id.to_string(),
            address,
            function_code: None,
        }
    }

    #[test]
    fn test_empty_input_yields_no_blocks() {
        assert!(optimize(&[], MAX_BLOCK_SIZE).is_empty());
    }

    #[test]
    fn test_single_register_is_one_block_of_one() {
        let blocks = optimize(&[register("r1", 40001)], MAX_BLOCK_SIZE);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].start_address, 40001);
        assert_eq!(blocks[0].count, 1);
    }

    #[test]
    fn test_contiguous_registers_coalesce() {
        let input = [register("r2", 40002), register("r1", 40001)];
        let blocks = optimize(&input, MAX_BLOCK_SIZE);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].start_address, 40001);
        assert_eq!(blocks[0].count, 2);
        assert_eq!(blocks[0].registers[0].register_id, "r1");
        assert_eq!(blocks[0].registers[1].register_id, "r2");
    }

    #[test]
    fn test_gap_splits_blocks() {
        let input = [register("r1", 40001), register("r3", 40003)];
        let blocks = optimize(&input, MAX_BLOCK_SIZE);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].count, 1);
        assert_eq!(blocks[1].start_address, 40003);
    }

    #[test]
    fn test_block_size_ceiling_splits() {
        let input: Vec<RegisterConfig> = (0..=MAX_BLOCK_SIZE)
            .map(|i| register(&format!("r{}", i), 40001 + i))
            .collect();
        let blocks = optimize(&input, MAX_BLOCK_SIZE);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].count, MAX_BLOCK_SIZE);
        assert_eq!(blocks[1].count, 1);
        assert_eq!(blocks[1].start_address, 40001 + MAX_BLOCK_SIZE);
    }

    #[test]
    fn test_union_of_blocks_equals_input() {
        let input: Vec<RegisterConfig> = [40001, 40002, 40007, 40010, 40011, 40012]
            .iter()
            .map(|&a| register(&format!("r{}", a), a))
            .collect();
        let blocks = optimize(&input, MAX_BLOCK_SIZE);
        let total: usize = blocks.iter().map(|b| b.registers.len()).sum();
        assert_eq!(total, input.len());
        for block in &blocks {
            for (offset, reg) in block.registers.iter().enumerate() {
                assert_eq!(reg.address, block.start_address + offset as u16);
            }
            assert!(block.count <= MAX_BLOCK_SIZE);
        }
    }

    #[test]
    fn test_normalize_holding_bank() {
        assert_eq!(normalize_address(40001), 0);
        assert_eq!(normalize_address(40005), 4);
        assert_eq!(normalize_address(49999), 9998);
    }

    #[test]
    fn test_normalize_input_bank() {
        assert_eq!(normalize_address(30001), 0);
        assert_eq!(normalize_address(30100), 99);
    }

    #[test]
    fn test_normalize_generic_one_based() {
        assert_eq!(normalize_address(1), 0);
        assert_eq!(normalize_address(100), 99);
        assert_eq!(normalize_address(0), 0);
    }
}
