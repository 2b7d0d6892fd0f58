//! # tdau-storage
//!
//! Relational store for bench projects. The run engine and the derivation
//! pass only see the [`TestStore`] trait; [`SqliteStore`] is the implementation
//! used on the bench.
//!
//! | Table | Key | Content |
//! |-------|-----|---------|
//! | `Project_Info` | Proj_Id | header written at run start |
//! | `Current_Combination` | (Current_Com, Proj_Id) | Ie1..3 triples |
//! | `TDAU` | (Diode_Id, Proj_Id) | board address, channel, serial number |
//! | `Test` | (Test_Id, Proj_Id) | plan row, raw readings, Ic, RS, Idea |

pub mod schema;
pub mod sqlite;
pub mod store;

pub use sqlite::{view_name, SqliteStore};
pub use store::{ProjectRow, TestStore};
