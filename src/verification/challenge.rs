//! Challenge secrets for OTP, UPI collect and bank micro-deposit checks.

use sha2::{Digest, Sha256};
use std::sync::Arc;
use uuid::Uuid;

use crate::config::Environment;
use crate::payments::utils::secure_eq;

pub trait ChallengeIssuer: Send + Sync {
    /// Six-digit one-time code.
    fn one_time_code(&self) -> String;

    /// Two micro-deposit amounts in minor units, each in 1..=99.
    fn micro_deposits(&self) -> [i64; 2];
}

/// Fixed values so sandbox flows can be completed without a delivery channel.
pub struct SandboxChallengeIssuer;

impl SandboxChallengeIssuer {
    pub const CODE: &'static str = "123456";
    pub const DEPOSITS: [i64; 2] = [12, 34];
}

impl ChallengeIssuer for SandboxChallengeIssuer {
    fn one_time_code(&self) -> String {
        Self::CODE.to_string()
    }

    fn micro_deposits(&self) -> [i64; 2] {
        Self::DEPOSITS
    }
}

pub struct RandomChallengeIssuer;

impl ChallengeIssuer for RandomChallengeIssuer {
    fn one_time_code(&self) -> String {
        format!("{:06}", Uuid::new_v4().as_u128() % 1_000_000)
    }

    fn micro_deposits(&self) -> [i64; 2] {
        let bytes = Uuid::new_v4().as_u128();
        let first = (bytes % 99) as i64 + 1;
        let second = ((bytes >> 64) % 99) as i64 + 1;
        [first, second]
    }
}

pub fn issuer_for(environment: Environment) -> Arc<dyn ChallengeIssuer> {
    match environment {
        Environment::Production => Arc::new(RandomChallengeIssuer),
        Environment::Sandbox => Arc::new(SandboxChallengeIssuer),
    }
}

pub fn hash_code(code: &str) -> String {
    hex::encode(Sha256::digest(code.trim().as_bytes()))
}

pub fn code_matches(code: &str, hash: &str) -> bool {
    secure_eq(hash_code(code).as_bytes(), hash.as_bytes())
}

/// Order-insensitive exact comparison of submitted deposit amounts.
pub fn deposits_match(expected: [i64; 2], submitted: [i64; 2]) -> bool {
    let mut a = expected;
    let mut b = submitted;
    a.sort_unstable();
    b.sort_unstable();
    a == b
}
