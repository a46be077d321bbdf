//! `internal.crypt.*`: password hashing, digests and HS256 tokens.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use mlua::{Lua, Result as LuaResult, Table, Value as LuaValue};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::rc::Rc;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

use super::{err_pair, ModuleScope};
use crate::config::BCRYPT_DEFAULT_COST;
use crate::runtime::conversions::{json_to_lua, lua_to_json};

type HmacSha256 = Hmac<Sha256>;

/// Token lifetime when `expires_in` is not given.
pub const DEFAULT_TOKEN_TTL_SECS: i64 = 3600;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TokenError {
    #[error("malformed token")]
    Malformed,
    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),
    #[error("invalid signature")]
    BadSignature,
    #[error("token expired")]
    Expired,
    #[error("secret must not be empty")]
    EmptySecret,
    #[error("claims must be a map")]
    ClaimsNotMap,
}

/// Signs `claims` as a compact HS256 JWT.
pub fn encode_hs256(claims: &Map<String, Value>, secret: &[u8]) -> Result<String, TokenError> {
    if secret.is_empty() {
        return Err(TokenError::EmptySecret);
    }
    let header = json!({"alg": "HS256", "typ": "JWT"});
    let signing_input = format!(
        "{}.{}",
        URL_SAFE_NO_PAD.encode(header.to_string()),
        URL_SAFE_NO_PAD.encode(Value::Object(claims.clone()).to_string())
    );
    let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| TokenError::EmptySecret)?;
    mac.update(signing_input.as_bytes());
    let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
    Ok(format!("{signing_input}.{signature}"))
}

/// Verifies an HS256 JWT and returns its claims.
///
/// `now` is seconds since the epoch; a token whose `exp` is not after `now`
/// is rejected.
pub fn decode_hs256(
    token: &str,
    secret: &[u8],
    now: i64,
) -> Result<Map<String, Value>, TokenError> {
    if secret.is_empty() {
        return Err(TokenError::EmptySecret);
    }
    let mut parts = token.split('.');
    let (Some(header), Some(payload), Some(signature), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(TokenError::Malformed);
    };

    let header: Value = decode_segment(header)?;
    match header.get("alg").and_then(Value::as_str) {
        Some("HS256") => {}
        Some(other) => return Err(TokenError::UnsupportedAlgorithm(other.to_string())),
        None => return Err(TokenError::Malformed),
    }

    let signature = URL_SAFE_NO_PAD
        .decode(signature)
        .map_err(|_| TokenError::Malformed)?;
    let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| TokenError::EmptySecret)?;
    let (signing_input, _) = token.rsplit_once('.').ok_or(TokenError::Malformed)?;
    mac.update(signing_input.as_bytes());
    mac.verify_slice(&signature)
        .map_err(|_| TokenError::BadSignature)?;

    let claims = match decode_segment(payload)? {
        Value::Object(claims) => claims,
        _ => return Err(TokenError::ClaimsNotMap),
    };
    let exp = claims
        .get("exp")
        .and_then(|exp| exp.as_i64().or_else(|| exp.as_f64().map(|f| f as i64)));
    if let Some(exp) = exp {
        if now >= exp {
            return Err(TokenError::Expired);
        }
    }
    Ok(claims)
}

fn decode_segment(segment: &str) -> Result<Value, TokenError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|_| TokenError::Malformed)?;
    serde_json::from_slice(&bytes).map_err(|_| TokenError::Malformed)
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

pub(super) fn build_bcrypt(lua: &Lua, scope: &Rc<ModuleScope>) -> LuaResult<Table> {
    let min = scope.services.bcrypt_min_cost;
    let max = scope.services.bcrypt_max_cost;
    let default = BCRYPT_DEFAULT_COST.max(min).min(max);

    let module = lua.create_table()?;
    module.raw_set("MinCost", min)?;
    module.raw_set("MaxCost", max)?;
    module.raw_set("DefaultCost", default)?;

    module.raw_set(
        "generate",
        lua.create_function(move |lua, (password, cost): (mlua::String, Option<i64>)| {
            let cost = cost.unwrap_or(i64::from(default));
            if cost < i64::from(min) || cost > i64::from(max) {
                return err_pair(lua, format!("cost {cost} outside {min}..={max}"));
            }
            match bcrypt::hash(&*password.as_bytes(), cost as u32) {
                Ok(hash) => Ok((LuaValue::String(lua.create_string(hash)?), LuaValue::Nil)),
                Err(e) => err_pair(lua, e),
            }
        })?,
    )?;

    module.raw_set(
        "compare",
        lua.create_function(|_, (hash, password): (String, mlua::String)| {
            Ok(bcrypt::verify(&*password.as_bytes(), &hash).unwrap_or(false))
        })?,
    )?;

    Ok(module)
}

pub(super) fn build_sha256(lua: &Lua, _scope: &Rc<ModuleScope>) -> LuaResult<Table> {
    let module = lua.create_table()?;
    module.raw_set(
        "sum",
        lua.create_function(|lua, data: mlua::String| {
            let digest = hex::encode(Sha256::digest(&*data.as_bytes()));
            Ok((LuaValue::String(lua.create_string(digest)?), LuaValue::Nil))
        })?,
    )?;
    Ok(module)
}

pub(super) fn build_jwt(lua: &Lua, _scope: &Rc<ModuleScope>) -> LuaResult<Table> {
    let module = lua.create_table()?;

    module.raw_set(
        "encode",
        lua.create_function(|lua, opts: Table| {
            let secret: String = opts.raw_get::<Option<String>>("secret")?.unwrap_or_default();
            let payload: LuaValue = opts.raw_get("payload")?;
            let expires_in = opts
                .raw_get::<Option<i64>>("expires_in")?
                .unwrap_or(DEFAULT_TOKEN_TTL_SECS);

            let mut claims = match payload {
                LuaValue::Nil => Map::new(),
                other => match lua_to_json(&other)? {
                    Value::Object(claims) => claims,
                    _ => return err_pair(lua, TokenError::ClaimsNotMap),
                },
            };
            let now = unix_now();
            let Some(exp) = now.checked_add(expires_in) else {
                return err_pair(lua, format!("expires_in {expires_in} is out of range"));
            };
            claims.insert("iat".to_string(), json!(now));
            claims.insert("exp".to_string(), json!(exp));

            match encode_hs256(&claims, secret.as_bytes()) {
                Ok(token) => Ok((LuaValue::String(lua.create_string(token)?), LuaValue::Nil)),
                Err(e) => err_pair(lua, e),
            }
        })?,
    )?;

    module.raw_set(
        "decode",
        lua.create_function(|lua, (token, opts): (String, Table)| {
            let secret: String = opts.raw_get::<Option<String>>("secret")?.unwrap_or_default();
            match decode_hs256(&token, secret.as_bytes(), unix_now()) {
                Ok(claims) => Ok((json_to_lua(lua, &Value::Object(claims))?, LuaValue::Nil)),
                Err(e) => err_pair(lua, e),
            }
        })?,
    )?;

    Ok(module)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claims(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_token_verifies_with_same_secret() {
        let token = encode_hs256(&claims(json!({"sub": "ada", "exp": 2000})), b"k").unwrap();
        assert_eq!(token.split('.').count(), 3);
        let decoded = decode_hs256(&token, b"k", 1000).unwrap();
        assert_eq!(decoded.get("sub"), Some(&json!("ada")));
    }

    #[test]
    fn test_wrong_secret_is_rejected() {
        let token = encode_hs256(&claims(json!({"sub": "ada"})), b"k").unwrap();
        assert_eq!(
            decode_hs256(&token, b"other", 0),
            Err(TokenError::BadSignature)
        );
    }

    #[test]
    fn test_expired_token_is_rejected() {
        let token = encode_hs256(&claims(json!({"exp": 1000})), b"k").unwrap();
        assert_eq!(decode_hs256(&token, b"k", 1000), Err(TokenError::Expired));
        assert!(decode_hs256(&token, b"k", 999).is_ok());
    }

    #[test]
    fn test_tampered_payload_is_rejected() {
        let token = encode_hs256(&claims(json!({"role": "user"})), b"k").unwrap();
        let mut parts: Vec<&str> = token.split('.').collect();
        let forged = URL_SAFE_NO_PAD.encode(r#"{"role":"admin"}"#);
        parts[1] = &forged;
        assert_eq!(
            decode_hs256(&parts.join("."), b"k", 0),
            Err(TokenError::BadSignature)
        );
    }

    #[test]
    fn test_malformed_and_foreign_algorithms() {
        assert_eq!(decode_hs256("a.b", b"k", 0), Err(TokenError::Malformed));
        assert_eq!(decode_hs256("a.b.c.d", b"k", 0), Err(TokenError::Malformed));

        let header = URL_SAFE_NO_PAD.encode(r#"{"alg":"none"}"#);
        let payload = URL_SAFE_NO_PAD.encode("{}");
        assert_eq!(
            decode_hs256(&format!("{header}.{payload}."), b"k", 0),
            Err(TokenError::UnsupportedAlgorithm("none".to_string()))
        );
    }

    #[test]
    fn test_empty_secret() {
        assert_eq!(
            encode_hs256(&Map::new(), b""),
            Err(TokenError::EmptySecret)
        );
    }

    #[test]
    fn test_bcrypt_round_trip_at_low_cost() {
        let hash = bcrypt::hash("hunter2", 4).unwrap();
        assert!(bcrypt::verify("hunter2", &hash).unwrap());
        assert!(!bcrypt::verify("hunter3", &hash).unwrap());
    }
}
