use crate::{
    address::{Address, Role},
    backend::{Call, LedgerBackend, Output},
    config::MintPolicy,
    ledger::{Amount, LedgerError, LedgerEvent, LedgerState, StorageLayout},
    shell::{DispatchFailure, ExecutionContext, ShellError},
};

pub const TOKEN_NAME: &str = "Upgradeable Token";
pub const TOKEN_SYMBOL: &str = "UPT";

/// Capped fungible ledger. Stateless: every field lives in the shell.
#[derive(Debug, Clone, Copy, Default)]
pub struct LedgerLogic;

impl LedgerLogic {
    pub const MODULE_ID: &'static str = "ledger-logic/v1";

    pub fn new() -> Self {
        Self
    }

    fn initialize(&self, ctx: &mut ExecutionContext<'_>, cap: Amount) -> Result<Output, ShellError> {
        let ledger = ctx.ledger_mut();
        if ledger.initialized {
            return Err(LedgerError::AlreadyInitialized.into());
        }
        ledger.cap = cap;
        ledger.initialized = true;
        ctx.emit(LedgerEvent::Initialized { cap });
        Ok(Output::Unit)
    }

    fn mint(
        &self,
        ctx: &mut ExecutionContext<'_>,
        to: Address,
        amount: Amount,
    ) -> Result<Output, ShellError> {
        if ctx.config().mint_policy == MintPolicy::Restricted {
            let caller = ctx.caller();
            if caller != ctx.check_address(Role::Minter) && caller != ctx.check_address(Role::Owner)
            {
                return Err(LedgerError::Unauthorized { caller }.into());
            }
        }
        let ledger = ctx.ledger_mut();
        let next_supply = ledger
            .total_supply
            .checked_add(amount)
            .filter(|supply| *supply <= ledger.cap)
            .ok_or(LedgerError::CapExceeded {
                cap: ledger.cap,
                total_supply: ledger.total_supply,
                amount,
            })?;
        ledger.credit_account(&to, amount);
        ledger.total_supply = next_supply;
        ctx.emit(LedgerEvent::Minted { to, amount });
        Ok(Output::Unit)
    }

    fn transfer(
        &self,
        ctx: &mut ExecutionContext<'_>,
        to: Address,
        amount: Amount,
    ) -> Result<Output, ShellError> {
        let from = ctx.caller();
        move_balance(ctx.ledger_mut(), &from, &to, amount)?;
        ctx.emit(LedgerEvent::Transfer { from, to, amount });
        Ok(Output::Unit)
    }

    // Overwrites. Deliberately no increase/decrease helpers.
    fn approve(
        &self,
        ctx: &mut ExecutionContext<'_>,
        spender: Address,
        amount: Amount,
    ) -> Result<Output, ShellError> {
        let owner = ctx.caller();
        ctx.ledger_mut().set_allowance(&owner, &spender, amount);
        ctx.emit(LedgerEvent::Approval {
            owner,
            spender,
            amount,
        });
        Ok(Output::Unit)
    }

    fn transfer_from(
        &self,
        ctx: &mut ExecutionContext<'_>,
        from: Address,
        to: Address,
        amount: Amount,
    ) -> Result<Output, ShellError> {
        let spender = ctx.caller();
        let ledger = ctx.ledger_mut();
        let available = ledger.allowance(&from, &spender);
        if available < amount {
            return Err(LedgerError::InsufficientAllowance {
                owner: from,
                spender,
                available,
                requested: amount,
            }
            .into());
        }
        move_balance(ledger, &from, &to, amount)?;
        ledger.set_allowance(&from, &spender, available - amount);
        ctx.emit(LedgerEvent::Transfer { from, to, amount });
        Ok(Output::Unit)
    }

    fn transfer_with_payload(
        &self,
        ctx: &mut ExecutionContext<'_>,
        to: Address,
        amount: Amount,
        data: &[u8],
    ) -> Result<Output, ShellError> {
        let from = ctx.caller();
        move_balance(ctx.ledger_mut(), &from, &to, amount)?;
        ctx.emit(LedgerEvent::PayloadTransfer {
            from,
            to,
            amount,
            data: data.to_vec(),
        });
        Ok(Output::Unit)
    }
}

fn move_balance(
    ledger: &mut LedgerState,
    from: &Address,
    to: &Address,
    amount: Amount,
) -> Result<(), LedgerError> {
    ledger.debit_account(from, amount)?;
    ledger.credit_account(to, amount);
    Ok(())
}

impl LedgerBackend for LedgerLogic {
    fn module_id(&self) -> &'static str {
        Self::MODULE_ID
    }

    fn layout(&self) -> StorageLayout {
        LedgerState::LAYOUT
    }

    fn execute(&self, ctx: &mut ExecutionContext<'_>, call: &Call) -> Result<Output, ShellError> {
        match call {
            Call::Name => Ok(Output::Text(TOKEN_NAME.to_string())),
            Call::Symbol => Ok(Output::Text(TOKEN_SYMBOL.to_string())),
            Call::Initialize { cap } => self.initialize(ctx, *cap),
            Call::Mint { to, amount } => self.mint(ctx, *to, *amount),
            Call::Transfer { to, amount } => self.transfer(ctx, *to, *amount),
            Call::Approve { spender, amount } => self.approve(ctx, *spender, *amount),
            Call::TransferFrom { from, to, amount } => {
                self.transfer_from(ctx, *from, *to, *amount)
            }
            Call::TransferWithPayload { to, amount, data } => {
                self.transfer_with_payload(ctx, *to, *amount, data)
            }
            Call::BalanceOf { owner } => Ok(Output::Amount(ctx.ledger().balance_of(owner))),
            Call::TotalSupply => Ok(Output::Amount(ctx.ledger().total_supply)),
            Call::Allowance { owner, spender } => {
                Ok(Output::Amount(ctx.ledger().allowance(owner, spender)))
            }
            Call::Cap => Ok(Output::Amount(ctx.ledger().cap)),
            Call::SetKeyHolder { .. } | Call::Addresses { .. } | Call::CheckAddress { .. } => {
                Err(DispatchFailure::Unsupported(call.name()).into())
            }
        }
    }
}
