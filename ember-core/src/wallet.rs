use crate::transaction::{Transaction, UtxoSet};
use serde::Serialize;
use shared::{KeyPair, Result, Signature};

/// Carteira local: um par de chaves secp256k1 e o endereço derivado
#[derive(Debug, Clone)]
pub struct Wallet {
    keypair: KeyPair,
}

impl Wallet {
    /// Cria uma carteira com chave nova
    ///
    /// # Errors
    ///
    /// Retorna erro se a geração ou serialização da chave falhar
    pub fn new() -> Result<Self> {
        Ok(Self {
            keypair: KeyPair::generate()?,
        })
    }

    /// Restaura uma carteira a partir da chave privada em hexadecimal
    ///
    /// # Errors
    ///
    /// Retorna erro se o hexadecimal não representar uma chave válida
    pub fn from_private_key_hex(private_key_hex: &str) -> Result<Self> {
        Ok(Self {
            keypair: KeyPair::from_private_key_hex(private_key_hex)?,
        })
    }

    #[must_use]
    pub fn address(&self) -> &str {
        self.keypair.address()
    }

    #[must_use]
    pub fn public_key_pem(&self) -> &str {
        self.keypair.public_key_pem()
    }

    #[must_use]
    pub fn private_key_hex(&self) -> String {
        self.keypair.private_key_hex()
    }

    /// Assina o JSON canônico de `data`
    ///
    /// # Errors
    ///
    /// Retorna erro se `data` não puder ser serializado
    pub fn sign<T: Serialize>(&self, data: &T) -> Result<Signature> {
        self.keypair.sign(data)
    }

    /// Saldo confirmado desta carteira no conjunto UTXO dado
    #[must_use]
    pub fn balance(&self, utxo_set: &UtxoSet) -> f64 {
        calculate_balance(utxo_set, self.address())
    }

    /// Constrói uma transação desta carteira para `recipient`
    ///
    /// # Errors
    ///
    /// Propaga as falhas de construção, inclusive fundos insuficientes
    pub fn create_transaction(
        &self,
        utxo_set: &UtxoSet,
        recipient: &str,
        amount: f64,
        fee_rate: f64,
    ) -> Result<Transaction> {
        Transaction::create(self, utxo_set, recipient, amount, fee_rate)
    }
}

/// Soma tudo que o conjunto UTXO credita ao endereço dado
#[must_use]
pub fn calculate_balance(utxo_set: &UtxoSet, address: &str) -> f64 {
    utxo_set
        .values()
        .flat_map(|outputs| outputs.get(address))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::TxOutputMap;

    #[test]
    fn test_balance_sums_across_outputs() {
        let wallet = Wallet::new().unwrap();
        let mut utxo_set = UtxoSet::new();

        let mut outputs_a = TxOutputMap::new();
        outputs_a.insert(wallet.address().to_string(), 30.0);
        outputs_a.insert("outro".to_string(), 5.0);
        utxo_set.insert("tx-a".to_string(), outputs_a);

        let mut outputs_b = TxOutputMap::new();
        outputs_b.insert(wallet.address().to_string(), 12.5);
        utxo_set.insert("tx-b".to_string(), outputs_b);

        assert_eq!(wallet.balance(&utxo_set), 42.5);
        assert_eq!(calculate_balance(&utxo_set, "ninguem"), 0.0);
    }

    #[test]
    fn test_sign_produces_verifiable_signature() {
        let wallet = Wallet::new().unwrap();
        let mut output = TxOutputMap::new();
        output.insert("bob".to_string(), 1.0);

        let signature = wallet.sign(&output).unwrap();
        assert!(shared::verify_signature(
            wallet.public_key_pem(),
            &output,
            &signature
        ));
    }

    #[test]
    fn test_restored_wallet_keeps_address() {
        let wallet = Wallet::new().unwrap();
        let restored = Wallet::from_private_key_hex(&wallet.private_key_hex()).unwrap();
        assert_eq!(wallet.address(), restored.address());
    }

    #[test]
    fn test_create_transaction_via_wallet() {
        let wallet = Wallet::new().unwrap();
        let mut outputs = TxOutputMap::new();
        outputs.insert(wallet.address().to_string(), 50.0);
        let mut utxo_set = UtxoSet::new();
        utxo_set.insert("tx-semente".to_string(), outputs);

        let tx = wallet
            .create_transaction(&utxo_set, "bob", 7.0, 0.000_01)
            .unwrap();
        tx.is_valid(Some(&utxo_set)).unwrap();
    }
}
