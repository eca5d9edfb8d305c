use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;

use rvxlate::cpu::config::{AdPolicy, HartConfig};
use rvxlate::cpu::csr;
use rvxlate::cpu::mmu::{MmuState, TranslationRequest};
use rvxlate::cpu::{Cpu, PrivilegeMode};
use rvxlate::memory::{Bus, DRAM_BASE};

#[derive(Parser)]
#[command(
    name = "rvxlate",
    version,
    about = "Resolve RISC-V virtual addresses and trap routing against a memory image"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Access {
    Fetch,
    Read,
    Write,
    Amo,
}

#[derive(Clone, Copy, ValueEnum)]
enum Mode {
    U,
    S,
    M,
}

impl From<Mode> for PrivilegeMode {
    fn from(m: Mode) -> Self {
        match m {
            Mode::U => PrivilegeMode::User,
            Mode::S => PrivilegeMode::Supervisor,
            Mode::M => PrivilegeMode::Machine,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Translate one access through the page tables held in a RAM image
    Translate {
        /// Raw RAM image containing the page tables
        #[arg(short, long)]
        image: PathBuf,

        /// Physical load address of the image (hex)
        #[arg(long, default_value = "0x80000000", value_parser = parse_hex)]
        load_addr: u64,

        /// RAM size in MiB (default: 128)
        #[arg(short, long, default_value = "128")]
        memory: u64,

        /// satp value (hex)
        #[arg(long, value_parser = parse_hex)]
        satp: u64,

        /// Virtual address to resolve (hex)
        #[arg(long, value_parser = parse_hex)]
        vaddr: u64,

        /// Access size in bytes
        #[arg(long, default_value = "8")]
        len: u64,

        #[arg(long, value_enum, default_value = "read")]
        access: Access,

        #[arg(long, value_enum, default_value = "s")]
        mode: Mode,

        /// Run with V=1 (enables the hypervisor extension)
        #[arg(long)]
        virt: bool,

        /// vsatp value (hex)
        #[arg(long, default_value = "0", value_parser = parse_hex)]
        vsatp: u64,

        /// hgatp value (hex)
        #[arg(long, default_value = "0", value_parser = parse_hex)]
        hgatp: u64,

        /// Allow Sv48 / Sv48x4 roots
        #[arg(long)]
        sv48: bool,

        /// Fault instead of updating accessed/dirty bits
        #[arg(long)]
        software_ad: bool,
    },
    /// Report which pending interrupt would be taken
    Interrupt {
        #[arg(long, value_parser = parse_hex)]
        mip: u64,

        #[arg(long, value_parser = parse_hex)]
        mie: u64,

        #[arg(long, default_value = "0", value_parser = parse_hex)]
        mideleg: u64,

        #[arg(long, default_value = "0", value_parser = parse_hex)]
        hideleg: u64,

        #[arg(long, default_value = "0", value_parser = parse_hex)]
        mstatus: u64,

        #[arg(long, value_enum, default_value = "m")]
        mode: Mode,

        #[arg(long)]
        virt: bool,
    },
}

fn parse_hex(s: &str) -> Result<u64, String> {
    u64::from_str_radix(s.trim_start_matches("0x"), 16).map_err(|e| format!("invalid hex value '{}': {}", s, e))
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Translate {
            image,
            load_addr,
            memory,
            satp,
            vaddr,
            len,
            access,
            mode,
            virt,
            vsatp,
            hgatp,
            sv48,
            software_ad,
        } => {
            let data = match std::fs::read(&image) {
                Ok(d) => d,
                Err(e) => {
                    eprintln!("Failed to read {}: {}", image.display(), e);
                    return ExitCode::FAILURE;
                }
            };
            let mut bus = Bus::new(memory * 1024 * 1024);
            if let Err(e) = bus.load_binary(&data, load_addr.wrapping_sub(DRAM_BASE)) {
                eprintln!("Failed to load image: {}", e);
                return ExitCode::FAILURE;
            }

            let policy = if software_ad {
                AdPolicy::Software
            } else {
                AdPolicy::Hardware
            };
            let config = HartConfig::default()
                .with_hypervisor(virt)
                .with_sv48(sv48)
                .with_ad_policy(policy);
            let mut cpu = Cpu::new(config);
            // Open PMP so that only paging decides the outcome
            cpu.csrs.write(csr::PMPADDR0, u64::MAX);
            cpu.csrs.write(csr::PMPCFG0, 0x1F);
            cpu.csrs.write(csr::SATP, satp);
            cpu.csrs.write(csr::VSATP, vsatp);
            cpu.csrs.write(csr::HGATP, hgatp);
            cpu.mode = mode.into();
            cpu.virt = virt && cpu.mode != PrivilegeMode::Machine;
            cpu.update_mmu_state();

            let req = match access {
                Access::Fetch => TranslationRequest::fetch(vaddr, len),
                Access::Read => TranslationRequest::read(vaddr, len),
                Access::Write => TranslationRequest::write(vaddr, len),
                Access::Amo => TranslationRequest::write(vaddr, len).atomic(),
            };
            match cpu.access(&mut bus, &req) {
                Ok(phys) => {
                    let how = match cpu.mmu.state(&req) {
                        MmuState::Direct => "direct",
                        MmuState::Translate => "translated",
                    };
                    println!("{:#x} -> {:#x} ({}, level {})", vaddr, phys.first.paddr, how, cpu.mmu.last_level);
                    if let Some(second) = phys.second {
                        println!("{:#x} -> {:#x} (second page)", second.vaddr, second.paddr);
                    }
                    ExitCode::SUCCESS
                }
                Err(fault) => {
                    println!("fault: {}", fault);
                    ExitCode::from(2)
                }
            }
        }
        Commands::Interrupt {
            mip,
            mie,
            mideleg,
            hideleg,
            mstatus,
            mode,
            virt,
        } => {
            let mut cpu = Cpu::new(HartConfig::default().with_hypervisor(virt || hideleg != 0));
            cpu.csrs.write(csr::MIP, mip);
            cpu.csrs.write(csr::MIE, mie);
            cpu.csrs.write(csr::MIDELEG, mideleg);
            cpu.csrs.write(csr::HIDELEG, hideleg);
            cpu.csrs.write(csr::MSTATUS, mstatus);
            cpu.mode = mode.into();
            cpu.virt = virt && cpu.mode != PrivilegeMode::Machine;
            match cpu.select_pending_interrupt() {
                Some(irq) => println!("{:?} (cause {})", irq, irq.code()),
                None => println!("none"),
            }
            ExitCode::SUCCESS
        }
    }
}
