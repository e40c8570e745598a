//! Core domain types shared by every layer

pub mod assignment;
pub mod chain;
pub mod constant;
pub mod dead_letter;
pub mod entity;
pub mod error;
pub mod message;
pub mod outcome;
pub mod record;
pub mod state;
