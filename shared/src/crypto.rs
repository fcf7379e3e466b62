//! Criptografia de curva elíptica do Embercoin (secp256k1 / ECDSA-SHA256).
//!
//! As assinaturas cobrem o JSON canônico do mapa de outputs e viajam como o
//! par `(r, s)` em hexadecimal. Chaves públicas são serializadas em PEM
//! (SubjectPublicKeyInfo) para que o destinatário possa verificar sem
//! nenhum contexto adicional.

use crate::hash::{canonical_json, sha256_hex};
use crate::{ChainError, Result};
use k256::ecdsa::signature::{Signer, Verifier};
use k256::ecdsa::{Signature as EcdsaSignature, SigningKey, VerifyingKey};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::pkcs8::{DecodePublicKey, EncodePublicKey, LineEnding};
use k256::FieldBytes;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

/// Quantidade de caracteres hexadecimais de um endereço
pub const ADDRESS_LEN: usize = 20;

/// Assinatura ECDSA decomposta em `(r, s)`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub r: String,
    pub s: String,
}

impl Signature {
    fn to_ecdsa(&self) -> Result<EcdsaSignature> {
        let r = hex::decode(&self.r).map_err(|_| ChainError::InvalidSignature)?;
        let s = hex::decode(&self.s).map_err(|_| ChainError::InvalidSignature)?;
        if r.len() != 32 || s.len() != 32 {
            return Err(ChainError::InvalidSignature);
        }
        EcdsaSignature::from_scalars(
            FieldBytes::clone_from_slice(&r),
            FieldBytes::clone_from_slice(&s),
        )
        .map_err(|_| ChainError::InvalidSignature)
    }

    fn from_ecdsa(sig: &EcdsaSignature) -> Self {
        let (r, s) = sig.split_bytes();
        Self {
            r: hex::encode(r),
            s: hex::encode(s),
        }
    }
}

/// Par de chaves secp256k1 de uma carteira
#[derive(Debug, Clone)]
pub struct KeyPair {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
    public_key_pem: String,
    address: String,
}

impl KeyPair {
    /// Gera um novo par de chaves aleatório
    ///
    /// # Errors
    ///
    /// Retorna erro se a serialização PEM da chave pública falhar
    pub fn generate() -> Result<Self> {
        Self::from_signing_key(SigningKey::random(&mut OsRng))
    }

    /// Restaura um par de chaves a partir da chave privada em hexadecimal
    ///
    /// # Errors
    ///
    /// Retorna erro se o hexadecimal não representar uma chave válida
    pub fn from_private_key_hex(private_key_hex: &str) -> Result<Self> {
        let bytes = hex::decode(private_key_hex)
            .map_err(|e| ChainError::CryptographicError(format!("chave privada inválida: {e}")))?;
        let signing_key = SigningKey::from_slice(&bytes)
            .map_err(|e| ChainError::CryptographicError(format!("chave privada inválida: {e}")))?;
        Self::from_signing_key(signing_key)
    }

    fn from_signing_key(signing_key: SigningKey) -> Result<Self> {
        let verifying_key = *signing_key.verifying_key();
        let public_key_pem = verifying_key
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| ChainError::CryptographicError(e.to_string()))?;
        let address = derive_address(&verifying_key);
        Ok(Self {
            signing_key,
            verifying_key,
            public_key_pem,
            address,
        })
    }

    /// Endereço derivado da chave pública (SHA-256 do ponto comprimido, 20 hex)
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Chave pública em PEM (SubjectPublicKeyInfo)
    #[must_use]
    pub fn public_key_pem(&self) -> &str {
        &self.public_key_pem
    }

    /// Chave privada em hexadecimal (para backup/restauração)
    #[must_use]
    pub fn private_key_hex(&self) -> String {
        hex::encode(self.signing_key.to_bytes())
    }

    /// Assina o JSON canônico de `data`
    ///
    /// # Errors
    ///
    /// Retorna erro se `data` não puder ser serializado
    pub fn sign<T: Serialize>(&self, data: &T) -> Result<Signature> {
        let payload = canonical_json(data)?;
        let sig: EcdsaSignature = self.signing_key.sign(payload.as_bytes());
        Ok(Signature::from_ecdsa(&sig))
    }

    /// Verifica uma assinatura produzida por este par de chaves
    #[must_use]
    pub fn verify_own<T: Serialize>(&self, data: &T, signature: &Signature) -> bool {
        let Ok(payload) = canonical_json(data) else {
            return false;
        };
        let Ok(sig) = signature.to_ecdsa() else {
            return false;
        };
        self.verifying_key.verify(payload.as_bytes(), &sig).is_ok()
    }
}

fn derive_address(verifying_key: &VerifyingKey) -> String {
    let compressed = verifying_key.to_encoded_point(true);
    let digest = sha256_hex(compressed.as_bytes());
    digest[..ADDRESS_LEN].to_string()
}

/// Deriva o endereço a partir de uma chave pública em PEM
///
/// # Errors
///
/// Retorna erro se o PEM não contiver uma chave secp256k1 válida
pub fn address_from_pem(public_key_pem: &str) -> Result<String> {
    let verifying_key = VerifyingKey::from_public_key_pem(public_key_pem)
        .map_err(|e| ChainError::CryptographicError(e.to_string()))?;
    Ok(derive_address(&verifying_key))
}

/// Verifica uma assinatura `(r, s)` contra o JSON canônico de `data`.
///
/// Qualquer falha (PEM malformado, assinatura corrompida, dados não
/// serializáveis) conta como verificação negativa, nunca como pânico.
#[must_use]
pub fn verify_signature<T: Serialize>(
    public_key_pem: &str,
    data: &T,
    signature: &Signature,
) -> bool {
    let Ok(verifying_key) = VerifyingKey::from_public_key_pem(public_key_pem) else {
        return false;
    };
    let Ok(payload) = canonical_json(data) else {
        return false;
    };
    let Ok(sig) = signature.to_ecdsa() else {
        return false;
    };
    verifying_key.verify(payload.as_bytes(), &sig).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn sample_output() -> BTreeMap<String, f64> {
        let mut output = BTreeMap::new();
        output.insert("destinatario".to_string(), 10.0);
        output.insert("remetente".to_string(), 39.999);
        output
    }

    #[test]
    fn test_sign_and_verify() {
        let keypair = KeyPair::generate().unwrap();
        let output = sample_output();

        let signature = keypair.sign(&output).unwrap();
        assert!(verify_signature(keypair.public_key_pem(), &output, &signature));
    }

    #[test]
    fn test_verify_rejects_tampered_data() {
        let keypair = KeyPair::generate().unwrap();
        let output = sample_output();
        let signature = keypair.sign(&output).unwrap();

        let mut tampered = output;
        tampered.insert("destinatario".to_string(), 9999.0);
        assert!(!verify_signature(keypair.public_key_pem(), &tampered, &signature));
    }

    #[test]
    fn test_verify_rejects_wrong_key() {
        let alice = KeyPair::generate().unwrap();
        let bob = KeyPair::generate().unwrap();
        let output = sample_output();
        let signature = alice.sign(&output).unwrap();

        assert!(!verify_signature(bob.public_key_pem(), &output, &signature));
    }

    #[test]
    fn test_address_shape() {
        let keypair = KeyPair::generate().unwrap();
        assert_eq!(keypair.address().len(), ADDRESS_LEN);
        assert!(keypair.address().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_restore_from_private_key_hex() {
        let keypair = KeyPair::generate().unwrap();
        let restored = KeyPair::from_private_key_hex(&keypair.private_key_hex()).unwrap();

        assert_eq!(keypair.address(), restored.address());
        assert_eq!(keypair.public_key_pem(), restored.public_key_pem());
    }

    #[test]
    fn test_address_from_pem_matches_keypair() {
        let keypair = KeyPair::generate().unwrap();
        let derived = address_from_pem(keypair.public_key_pem()).unwrap();
        assert_eq!(derived, keypair.address());
    }

    #[test]
    fn test_malformed_signature_is_rejected() {
        let keypair = KeyPair::generate().unwrap();
        let output = sample_output();
        let bogus = Signature {
            r: "zz".to_string(),
            s: "11".to_string(),
        };
        assert!(!verify_signature(keypair.public_key_pem(), &output, &bogus));
    }
}
