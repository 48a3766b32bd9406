// lib.rs

#![forbid(unsafe_code)]

pub mod rdt;
