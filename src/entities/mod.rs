// Entity definitions - one file per vault entity
//
// Each file declares the entity's fields (natural key, ordered hash-diff
// attributes, hub references, measures) and its storage mapping (DDL and the
// fixed statements the handlers bind values into).

pub mod customer;
pub mod product;
pub mod sale;
