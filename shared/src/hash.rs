use crate::{ChainError, Result};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Codifica um valor em JSON canônico (chaves ordenadas, sem espaços).
///
/// A representação de objetos do `serde_json` é um `BTreeMap`, portanto a
/// ordenação lexicográfica das chaves é garantida pela própria conversão
/// para `Value`. Todos os nós DEVEM produzir bytes idênticos para o mesmo
/// valor; é esse encoding que alimenta hashes e assinaturas.
///
/// # Errors
///
/// Retorna erro se o valor não puder ser convertido em JSON
pub fn canonical_json<T: Serialize>(value: &T) -> Result<String> {
    let value = serde_json::to_value(value)
        .map_err(|e| ChainError::SerializationError(e.to_string()))?;
    Ok(value.to_string())
}

/// SHA-256 em hexadecimal minúsculo
#[must_use]
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Hash de consenso sobre uma lista de argumentos heterogêneos.
///
/// Cada argumento é serializado em JSON canônico; as strings resultantes são
/// ordenadas lexicograficamente antes da concatenação, de modo que quem chama
/// não precisa impor uma ordem. A ordenação faz parte do consenso: alterá-la
/// muda todos os hashes de bloco.
#[must_use]
pub fn crypto_hash(args: &[Value]) -> String {
    let mut stringified: Vec<String> = args.iter().map(Value::to_string).collect();
    stringified.sort();
    sha256_hex(stringified.concat().as_bytes())
}

/// Expande uma string hexadecimal para sua forma binária ("f2" -> "11110010").
///
/// Usada no teste de prefixo do proof-of-work.
///
/// # Errors
///
/// Retorna [`ChainError::InvalidHash`] se algum caractere não for hexadecimal
pub fn hex_to_binary(hex_str: &str) -> Result<String> {
    let mut binary = String::with_capacity(hex_str.len() * 4);
    for c in hex_str.chars() {
        let nibble = c.to_digit(16).ok_or(ChainError::InvalidHash)?;
        binary.push_str(&format!("{nibble:04b}"));
    }
    Ok(binary)
}

/// Conta os bits zero iniciais de um hash hexadecimal.
///
/// # Errors
///
/// Retorna [`ChainError::InvalidHash`] se a string não for hexadecimal
pub fn leading_zero_bits(hash: &str) -> Result<u32> {
    let mut zeros = 0u32;
    for c in hash.chars() {
        let nibble = c.to_digit(16).ok_or(ChainError::InvalidHash)?;
        if nibble == 0 {
            zeros += 4;
        } else {
            zeros += nibble.leading_zeros() - 28;
            break;
        }
    }
    Ok(zeros)
}

/// Verifica se um hash atende à dificuldade (bits zero iniciais).
///
/// Strings não-hexadecimais nunca atendem.
#[must_use]
pub fn meets_difficulty(hash: &str, difficulty: u32) -> bool {
    leading_zero_bits(hash).is_ok_and(|zeros| zeros >= difficulty)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_crypto_hash_deterministic() {
        let a = crypto_hash(&[json!("one"), json!(2), json!([3])]);
        let b = crypto_hash(&[json!("one"), json!(2), json!([3])]);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_crypto_hash_order_independent() {
        // A ordenação interna torna a ordem dos argumentos irrelevante
        let a = crypto_hash(&[json!("one"), json!(2)]);
        let b = crypto_hash(&[json!(2), json!("one")]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_crypto_hash_sensitive_to_content() {
        let a = crypto_hash(&[json!("foo")]);
        let b = crypto_hash(&[json!("bar")]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_canonical_json_sorts_keys() {
        use std::collections::HashMap;
        let mut map = HashMap::new();
        map.insert("zeta", 1);
        map.insert("alpha", 2);
        assert_eq!(canonical_json(&map).unwrap(), r#"{"alpha":2,"zeta":1}"#);
    }

    #[test]
    fn test_hex_to_binary() {
        assert_eq!(hex_to_binary("f2").unwrap(), "11110010");
        assert_eq!(hex_to_binary("00").unwrap(), "00000000");
        assert!(hex_to_binary("xyz").is_err());
    }

    #[test]
    fn test_leading_zero_bits() {
        assert_eq!(leading_zero_bits("0f").unwrap(), 4);
        assert_eq!(leading_zero_bits("8").unwrap(), 0);
        assert_eq!(leading_zero_bits("1").unwrap(), 3);
        assert_eq!(leading_zero_bits("00").unwrap(), 8);
    }

    #[test]
    fn test_meets_difficulty() {
        assert!(meets_difficulty("00ff", 8));
        assert!(!meets_difficulty("00ff", 9));
        assert!(!meets_difficulty("genesis_last_hash", 1));
    }
}
