//! Configuration section definitions.
//!
//! | Section     | Purpose                                   |
//! |-------------|-------------------------------------------|
//! | `[resolve]` | Include resolution deadline and depth     |
//! | `[bus]`     | Correlation bus safety limits             |

mod bus;
mod resolve;

pub use bus::BusConfig;
pub use resolve::ResolveConfig;
