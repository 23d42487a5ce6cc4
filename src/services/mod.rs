//! Business logic services

pub mod feed;
pub mod futures;
pub mod portfolio;
pub mod price;
pub mod spot;

#[cfg(test)]
pub(crate) mod support;
