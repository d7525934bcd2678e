//! CLI command implementations.
//!
//! | Module      | Commands handled      |
//! |-------------|-----------------------|
//! | `init`      | `Init`                |
//! | `submit`    | `Submit`, `Unblock`   |
//! | `serve`     | `Serve`               |
//! | `inspect`   | `Show`, `List`        |
//! | `simulate`  | `Simulate`            |

pub mod init;
pub mod inspect;
pub mod serve;
pub mod simulate;
pub mod submit;

use anyhow::Result;
use baton::config::BatonConfig;
use baton::store::{DbHandle, RunDb};
use baton_common::RiskSignals;

use super::SignalArgs;

pub use init::cmd_init;
pub use inspect::{cmd_list, cmd_show};
pub use serve::cmd_serve;
pub use simulate::cmd_simulate;
pub use submit::{cmd_submit, cmd_unblock};

fn open_db(config: &BatonConfig) -> Result<RunDb> {
    Ok(RunDb::new(&config.db_path())?.with_max_attempts(config.settings.queues.max_attempts))
}

fn open_handle(config: &BatonConfig) -> Result<DbHandle> {
    Ok(DbHandle::new(open_db(config)?))
}

impl From<&SignalArgs> for RiskSignals {
    fn from(args: &SignalArgs) -> Self {
        RiskSignals {
            missing_secret: args.missing_secret,
            destructive_change: args.destructive_change,
            ambiguous_spec: args.ambiguous_spec,
        }
    }
}
