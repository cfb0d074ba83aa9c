use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{anyhow, bail, Context, Result};
use base64::{engine::general_purpose, Engine as _};
use clap::{Args, Parser, Subcommand};
use ed25519_dalek::SigningKey;
use rand::{rngs::OsRng, RngCore};
use tracing_subscriber::EnvFilter;

use upt_ledger::{
    backend::builtin_module, store, Address, Amount, Call, DelegatingShell, LedgerLogic, Role,
    ShellConfig,
};

#[derive(Parser)]
#[command(name = "upt", version, about = "Operate an upgradeable token ledger kept in a JSON state file")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate an Ed25519 key pair (sk.hex, pk.hex) and print its address
    Keygen {
        #[arg(long)]
        out_dir: PathBuf,
    },
    /// Create a new shell owned by --key
    Create {
        #[arg(long)]
        state: PathBuf,
        #[arg(long)]
        key: PathBuf,
        /// JSON shell config (mint policy, reentrancy)
        #[arg(long)]
        config: Option<PathBuf>,
        /// Overwrite an existing state file
        #[arg(long)]
        force: bool,
    },
    /// Deploy a built-in backend module and print its address
    Deploy {
        #[command(flatten)]
        target: Target,
        #[arg(long, default_value = LedgerLogic::MODULE_ID)]
        module: String,
    },
    /// Point a registry role at an address (owner only)
    SetKeyHolder {
        #[command(flatten)]
        target: Target,
        role: Role,
        holder: Address,
    },
    /// Print one registry entry, or all of them
    Addresses {
        #[arg(long)]
        state: PathBuf,
        role: Option<Role>,
    },
    /// Run a ledger operation through the active controller
    Call {
        #[arg(long)]
        state: PathBuf,
        /// Caller key; optional for read-only operations
        #[arg(long)]
        key: Option<PathBuf>,
        #[command(subcommand)]
        op: LedgerOp,
    },
    /// Print and verify the admin journal
    Journal {
        #[arg(long)]
        state: PathBuf,
    },
    /// Print committed ledger events as JSON lines
    Events {
        #[arg(long)]
        state: PathBuf,
    },
    /// Summarize registry, supply and state root
    Status {
        #[arg(long)]
        state: PathBuf,
    },
}

#[derive(Args)]
struct Target {
    #[arg(long)]
    state: PathBuf,
    #[arg(long)]
    key: PathBuf,
}

#[derive(Subcommand)]
enum LedgerOp {
    Name,
    Symbol,
    Cap,
    TotalSupply,
    CheckAddress {
        role: Role,
    },
    BalanceOf {
        owner: Address,
    },
    Allowance {
        owner: Address,
        spender: Address,
    },
    Initialize {
        #[arg(value_parser = parse_amount)]
        cap: Amount,
    },
    Mint {
        to: Address,
        #[arg(value_parser = parse_amount)]
        amount: Amount,
    },
    Transfer {
        to: Address,
        #[arg(value_parser = parse_amount)]
        amount: Amount,
    },
    Approve {
        spender: Address,
        #[arg(value_parser = parse_amount)]
        amount: Amount,
    },
    TransferFrom {
        from: Address,
        to: Address,
        #[arg(value_parser = parse_amount)]
        amount: Amount,
    },
    TransferWithPayload {
        to: Address,
        #[arg(value_parser = parse_amount)]
        amount: Amount,
        #[command(flatten)]
        payload: Payload,
    },
}

#[derive(Args)]
#[group(required = true, multiple = false)]
struct Payload {
    #[arg(long)]
    data_hex: Option<String>,
    #[arg(long)]
    data_b64: Option<String>,
}

impl Payload {
    fn decode(&self) -> Result<Vec<u8>> {
        match (&self.data_hex, &self.data_b64) {
            (Some(h), _) => {
                let h = h.trim();
                hex::decode(h.strip_prefix("0x").unwrap_or(h)).context("invalid --data-hex")
            }
            (None, Some(b)) => general_purpose::STANDARD
                .decode(b.trim())
                .context("invalid --data-b64"),
            (None, None) => bail!("one of --data-hex or --data-b64 is required"),
        }
    }
}

impl LedgerOp {
    fn is_read_only(&self) -> bool {
        matches!(
            self,
            LedgerOp::Name
                | LedgerOp::Symbol
                | LedgerOp::Cap
                | LedgerOp::TotalSupply
                | LedgerOp::CheckAddress { .. }
                | LedgerOp::BalanceOf { .. }
                | LedgerOp::Allowance { .. }
        )
    }

    fn into_call(self) -> Result<Call> {
        Ok(match self {
            LedgerOp::Name => Call::Name,
            LedgerOp::Symbol => Call::Symbol,
            LedgerOp::Cap => Call::Cap,
            LedgerOp::TotalSupply => Call::TotalSupply,
            LedgerOp::CheckAddress { role } => Call::CheckAddress { role },
            LedgerOp::BalanceOf { owner } => Call::BalanceOf { owner },
            LedgerOp::Allowance { owner, spender } => Call::Allowance { owner, spender },
            LedgerOp::Initialize { cap } => Call::Initialize { cap },
            LedgerOp::Mint { to, amount } => Call::Mint { to, amount },
            LedgerOp::Transfer { to, amount } => Call::Transfer { to, amount },
            LedgerOp::Approve { spender, amount } => Call::Approve { spender, amount },
            LedgerOp::TransferFrom { from, to, amount } => Call::TransferFrom { from, to, amount },
            LedgerOp::TransferWithPayload {
                to,
                amount,
                payload,
            } => Call::TransferWithPayload {
                to,
                amount,
                data: payload.decode()?,
            },
        })
    }
}

/// Plain integers, `_` separators allowed, plus `<n>e<exp>` shorthand
/// (`100000e18`).
fn parse_amount(s: &str) -> Result<Amount, String> {
    let cleaned = s.trim().replace('_', "");
    let (mantissa, exp) = match cleaned.split_once(['e', 'E']) {
        Some((m, e)) => (m, e.parse::<u32>().map_err(|e| format!("bad exponent: {e}"))?),
        None => (cleaned.as_str(), 0),
    };
    let mantissa = mantissa
        .parse::<Amount>()
        .map_err(|e| format!("bad amount {s:?}: {e}"))?;
    10u128
        .checked_pow(exp)
        .and_then(|scale| mantissa.checked_mul(scale))
        .ok_or_else(|| format!("amount {s:?} does not fit in 128 bits"))
}

fn load_key(path: &Path) -> Result<(SigningKey, Address)> {
    let text = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let bytes = hex::decode(text.trim()).with_context(|| format!("{} is not hex", path.display()))?;
    let sk: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| anyhow!("{}: secret key must be 32 bytes", path.display()))?;
    let sk = SigningKey::from_bytes(&sk);
    let address = Address::from_verifying_key(&sk.verifying_key());
    Ok((sk, address))
}

fn caller_of(path: &Path) -> Result<Address> {
    Ok(load_key(path)?.1)
}

fn open(state: &Path) -> Result<DelegatingShell> {
    store::load(state).with_context(|| format!("load shell from {}", state.display()))
}

fn persist(shell: &DelegatingShell, state: &Path) -> Result<()> {
    store::save(shell, state).with_context(|| format!("save shell to {}", state.display()))
}

fn keygen_cmd(out_dir: &Path) -> Result<()> {
    fs::create_dir_all(out_dir).with_context(|| format!("mkdir {}", out_dir.display()))?;
    let mut sk_bytes = [0u8; 32];
    OsRng.fill_bytes(&mut sk_bytes);
    let sk = SigningKey::from_bytes(&sk_bytes);
    let pk = sk.verifying_key();

    fs::write(out_dir.join("sk.hex"), hex::encode(sk_bytes))?;
    fs::write(out_dir.join("pk.hex"), hex::encode(pk.as_bytes()))?;
    println!("{}", Address::from_verifying_key(&pk));
    tracing::info!(dir = %out_dir.display(), "keypair written");
    Ok(())
}

fn create_cmd(state: &Path, key: &Path, config: Option<&Path>, force: bool) -> Result<()> {
    if state.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", state.display());
    }
    let owner = caller_of(key)?;
    let config = match config {
        Some(path) => ShellConfig::load(path)?,
        None => ShellConfig::default(),
    };
    let shell = DelegatingShell::new(owner, config);
    persist(&shell, state)?;
    println!("{}", shell.address());
    Ok(())
}

fn deploy_cmd(target: &Target, module: &str) -> Result<()> {
    let deployer = caller_of(&target.key)?;
    let mut shell = open(&target.state)?;
    let code = builtin_module(module).ok_or_else(|| anyhow!("unknown module {module:?}"))?;
    let address = shell.deploy(deployer, code);
    persist(&shell, &target.state)?;
    println!("{address}");
    Ok(())
}

fn set_key_holder_cmd(target: &Target, role: Role, holder: Address) -> Result<()> {
    let caller = caller_of(&target.key)?;
    let mut shell = open(&target.state)?;
    shell
        .set_key_holder(caller, role, holder)
        .with_context(|| format!("setKeyHolder({role}, {holder})"))?;
    persist(&shell, &target.state)?;
    println!("ok");
    Ok(())
}

fn addresses_cmd(state: &Path, role: Option<Role>) -> Result<()> {
    let shell = open(state)?;
    match role {
        Some(role) => println!("{}", shell.addresses(role)),
        None => {
            for role in Role::ALL {
                println!("{role:<10} {}", shell.addresses(role));
            }
        }
    }
    Ok(())
}

fn call_cmd(state: &Path, key: Option<&Path>, op: LedgerOp) -> Result<()> {
    let read_only = op.is_read_only();
    let caller = match key {
        Some(path) => caller_of(path)?,
        None if read_only => Address::ZERO,
        None => bail!("--key is required for state-changing operations"),
    };
    let call = op.into_call()?;
    let mut shell = open(state)?;
    let output = shell
        .invoke(caller, &call)
        .with_context(|| format!("{} rejected", call.name()))?;
    if !read_only {
        persist(&shell, state)?;
    }
    println!("{output}");
    Ok(())
}

fn journal_cmd(state: &Path) -> Result<()> {
    // load already refuses a broken chain; verify again for the report
    let shell = open(state)?;
    let journal = shell.journal();
    for entry in journal.entries() {
        let c = &entry.change;
        println!(
            "#{:<4} {:<10} {} -> {}  by {}  {}",
            entry.seq,
            c.role,
            c.previous,
            c.holder,
            c.caller,
            hex::encode(&entry.digest[..8])
        );
    }
    journal.verify()?;
    println!(
        "journal: {} entries, head {}, chain OK",
        journal.len(),
        hex::encode(journal.head())
    );
    Ok(())
}

fn events_cmd(state: &Path) -> Result<()> {
    let shell = open(state)?;
    for event in shell.events() {
        println!("{}", serde_json::to_string(event)?);
    }
    Ok(())
}

fn status_cmd(state: &Path) -> Result<()> {
    let shell = open(state)?;
    let ledger = shell.ledger();
    let controller = shell.addresses(Role::Controller);
    let module = shell
        .catalog()
        .get(&controller)
        .map(|m| m.module_id())
        .unwrap_or("-");
    println!("shell        {}", shell.address());
    println!("owner        {}", shell.addresses(Role::Owner));
    println!("controller   {controller} ({module})");
    println!("minter       {}", shell.addresses(Role::Minter));
    println!("initialized  {}", ledger.initialized);
    println!("cap          {}", ledger.cap);
    println!("total supply {}", ledger.total_supply);
    println!("holders      {}", ledger.balances.len());
    println!("state root   {}", hex::encode(ledger.state_root()));
    println!(
        "journal head {} ({} entries)",
        hex::encode(shell.journal().head()),
        shell.journal().len()
    );
    println!("events       {}", shell.events().len());
    Ok(())
}

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match Cli::parse().command {
        Command::Keygen { out_dir } => keygen_cmd(&out_dir),
        Command::Create {
            state,
            key,
            config,
            force,
        } => create_cmd(&state, &key, config.as_deref(), force),
        Command::Deploy { target, module } => deploy_cmd(&target, &module),
        Command::SetKeyHolder {
            target,
            role,
            holder,
        } => set_key_holder_cmd(&target, role, holder),
        Command::Addresses { state, role } => addresses_cmd(&state, role),
        Command::Call { state, key, op } => call_cmd(&state, key.as_deref(), op),
        Command::Journal { state } => journal_cmd(&state),
        Command::Events { state } => events_cmd(&state),
        Command::Status { state } => status_cmd(&state),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn amounts_accept_exponent_shorthand() {
        assert_eq!(parse_amount("42").unwrap(), 42);
        assert_eq!(parse_amount("1_000").unwrap(), 1000);
        assert_eq!(parse_amount("100000e18").unwrap(), 100_000 * 10u128.pow(18));
        assert!(parse_amount("1e40").is_err());
        assert!(parse_amount("-1").is_err());
        assert!(parse_amount("ten").is_err());
    }

    #[test]
    fn payload_decodes_hex_or_base64() {
        let hex_payload = Payload {
            data_hex: Some("0xdeadbeef".into()),
            data_b64: None,
        };
        assert_eq!(hex_payload.decode().unwrap(), vec![0xde, 0xad, 0xbe, 0xef]);
        let b64_payload = Payload {
            data_hex: None,
            data_b64: Some("3q2+7w==".into()),
        };
        assert_eq!(b64_payload.decode().unwrap(), vec![0xde, 0xad, 0xbe, 0xef]);
    }

    #[test]
    fn mutating_call_needs_a_key() {
        let cli = Cli::try_parse_from([
            "upt",
            "call",
            "--state",
            "s.json",
            "mint",
            "0x1111111111111111111111111111111111111111",
            "5e3",
        ])
        .unwrap();
        let Command::Call { key, op, .. } = cli.command else {
            panic!("expected call");
        };
        assert!(key.is_none());
        assert!(!op.is_read_only());
        assert!(call_cmd(Path::new("s.json"), None, op).is_err());
    }

    #[test]
    fn payload_flags_are_exclusive() {
        let parsed = Cli::try_parse_from([
            "upt",
            "call",
            "--state",
            "s.json",
            "transfer-with-payload",
            "0x1111111111111111111111111111111111111111",
            "1",
            "--data-hex",
            "00",
            "--data-b64",
            "AA==",
        ]);
        assert!(parsed.is_err());
    }
}
