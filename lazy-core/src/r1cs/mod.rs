pub mod builder;
pub mod coeff_table;
pub mod constraint;
pub mod lazy;
pub mod linear;
pub mod term;
