// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod otel;
mod policy;

pub mod adapter;
pub mod address;
pub mod channel;
pub mod configuration;
pub mod connection;
pub mod context;
pub mod dispatch;
pub mod errors;
pub mod exchange;
pub mod group;
pub mod message;
pub mod queue;
pub mod serialization;
pub mod session;
pub mod topology;
pub mod transaction;
pub mod transport;
pub mod wire;
pub mod worker;
