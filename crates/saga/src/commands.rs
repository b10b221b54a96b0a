//! Commands accepted by the Pix saga.

use common::{AccountId, CommandId};
use domain::Money;

/// Command to send a Pix payment from an account.
#[derive(Debug, Clone)]
pub struct SendPix {
    pub command_id: CommandId,
    pub account_id: AccountId,
    pub amount: Money,
    pub pix_key: String,
}

impl SendPix {
    pub fn new(
        command_id: impl Into<CommandId>,
        account_id: AccountId,
        amount: Money,
        pix_key: impl Into<String>,
    ) -> Self {
        Self {
            command_id: command_id.into(),
            account_id,
            amount,
            pix_key: pix_key.into(),
        }
    }
}
