//! SeaORM entity models
//!
//! Database entities for Parley

mod session;

pub use session::{
    Entity as SessionEntity,
    Model as SessionRow,
    Column as SessionColumn,
};
