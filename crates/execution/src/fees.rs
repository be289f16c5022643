use mirrorbot_core_types::LAMPORTS_PER_SOL;

/// Flat signature fee charged by the chain.
pub const BASE_TX_FEE_LAMPORTS: u64 = 5_000;
/// Rent-exempt balance for a new associated token account.
pub const ATA_CREATE_RENT_LAMPORTS: u64 = 2_039_280;

#[derive(Debug, Clone, Copy)]
pub struct FeeEstimate {
    pub base_lamports: u64,
    pub priority_lamports: u64,
    pub ata_rent_lamports: u64,
}

impl FeeEstimate {
    pub fn total_lamports(&self) -> u64 {
        self.base_lamports + self.priority_lamports + self.ata_rent_lamports
    }

    pub fn total_sol(&self) -> f64 {
        self.total_lamports() as f64 / LAMPORTS_PER_SOL as f64
    }
}

pub fn estimate_fee(priority_fee_lamports: u64, new_token: bool) -> FeeEstimate {
    FeeEstimate {
        base_lamports: BASE_TX_FEE_LAMPORTS,
        priority_lamports: priority_fee_lamports,
        ata_rent_lamports: if new_token { ATA_CREATE_RENT_LAMPORTS } else { 0 },
    }
}

pub fn fee_pct(fee_lamports: u64, spend_lamports: u64) -> f64 {
    if spend_lamports == 0 {
        return f64::INFINITY;
    }
    fee_lamports as f64 / spend_lamports as f64 * 100.0
}

/// Small trades tolerate proportionally more overhead: the base ceiling
/// applies from 0.5 SOL up, doubles under that, and triples under 0.1 SOL.
pub fn adaptive_max_fee_pct(base_max_pct: f64, spend_lamports: u64) -> f64 {
    let spend_sol = spend_lamports as f64 / LAMPORTS_PER_SOL as f64;
    if spend_sol >= 0.5 {
        base_max_pct
    } else if spend_sol >= 0.1 {
        base_max_pct * 2.0
    } else {
        base_max_pct * 3.0
    }
}
