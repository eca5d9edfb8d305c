/// Accessed/dirty bit management policy for leaf PTEs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AdPolicy {
    /// The walker sets A (and D on writes) in memory as part of the walk.
    #[default]
    Hardware,
    /// A clear A (or D on writes) raises a page fault for the handler to fix.
    Software,
}

/// Which PMP checker is wired into the access path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PmpVariant {
    /// No PMP entries implemented; every physical access is allowed.
    Disabled,
    #[default]
    Standard,
    /// Entries carry a table bit; permissions come from a two-level table.
    Table,
}

/// Per-hart feature selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HartConfig {
    /// H extension: two-stage translation, VS delegation, guest faults
    pub hypervisor: bool,
    /// Accept Sv48 / Sv48x4 root modes
    pub sv48: bool,
    pub ad_policy: AdPolicy,
    pub pmp: PmpVariant,
    /// Number of implemented PMP entries (at most 16)
    pub pmp_entries: usize,
    /// PMP granularity G (region size is 2^(G+2) bytes)
    pub pmp_grain: u32,
    /// Global isolation bitmap controlled by the MBMC CSR
    pub bitmap: bool,
    /// Raise address-misaligned faults instead of splitting the access
    pub misaligned_trap: bool,
    /// Record instruction bits in xtval for illegal/virtual instruction traps
    pub tval_illegal_instr: bool,
    /// Sign-extend address trap values from the top VA bit
    pub tval_sign_extend: bool,
    /// Local counter-overflow interrupt present
    pub lcofi: bool,
}

impl Default for HartConfig {
    fn default() -> Self {
        Self {
            hypervisor: false,
            sv48: false,
            ad_policy: AdPolicy::Hardware,
            pmp: PmpVariant::Standard,
            pmp_entries: 16,
            pmp_grain: 0,
            bitmap: false,
            misaligned_trap: false,
            tval_illegal_instr: true,
            tval_sign_extend: false,
            lcofi: false,
        }
    }
}

impl HartConfig {
    pub fn with_hypervisor(mut self, on: bool) -> Self {
        self.hypervisor = on;
        self
    }

    pub fn with_sv48(mut self, on: bool) -> Self {
        self.sv48 = on;
        self
    }

    pub fn with_ad_policy(mut self, policy: AdPolicy) -> Self {
        self.ad_policy = policy;
        self
    }

    pub fn with_pmp(mut self, variant: PmpVariant, entries: usize) -> Self {
        self.pmp = variant;
        self.pmp_entries = entries.min(16);
        self
    }

    pub fn with_pmp_grain(mut self, grain: u32) -> Self {
        // pmpaddr holds 54 address bits
        self.pmp_grain = grain.min(54);
        self
    }

    pub fn with_bitmap(mut self, on: bool) -> Self {
        self.bitmap = on;
        self
    }

    pub fn with_misaligned_trap(mut self, on: bool) -> Self {
        self.misaligned_trap = on;
        self
    }

    pub fn with_tval_illegal_instr(mut self, on: bool) -> Self {
        self.tval_illegal_instr = on;
        self
    }

    pub fn with_tval_sign_extend(mut self, on: bool) -> Self {
        self.tval_sign_extend = on;
        self
    }

    pub fn with_lcofi(mut self, on: bool) -> Self {
        self.lcofi = on;
        self
    }
}
