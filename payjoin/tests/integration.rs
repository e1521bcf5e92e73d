mod integration {
    use std::str::FromStr;
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use bitcoin::bip32::Xpriv;
    use bitcoin::consensus::encode::{deserialize_hex, serialize_hex};
    use bitcoin::psbt::Psbt;
    use bitcoin::{Amount, Network, OutPoint, ScriptBuf, Transaction, TxOut};
    use payjoin::receive::{
        BroadcastResult, DerivationScheme, EndpointConfig, Error, Explorer, Headers,
        PayjoinEndpoint, PayjoinProposal, ReceivedCoin, ScriptType, StaleRebroadcaster,
        UtxoOrdering, PAYJOIN_CONFIRMATION_SENTINEL,
    };
    use payjoin::{ErrorCode, ImplementationError};
    use payjoin_test_utils::{
        init_tracing, invoice_method, p2wpkh_script, receiver_coin, sender_psbt, sender_tx,
        BoxError, InMemoryInvoiceRepository, MockExplorer, SenderFixture,
    };
    use tokio_util::sync::CancellationToken;

    const WALLET: &str = "merchant";
    const INVOICE: &str = "invoice-1";

    struct HeaderMock {
        content_length: String,
    }

    impl HeaderMock {
        fn new(body: &str) -> HeaderMock { HeaderMock { content_length: body.len().to_string() } }
    }

    impl Headers for HeaderMock {
        fn get_header(&self, key: &str) -> Option<&str> {
            match key {
                "Content-Type" => Some("text/plain"),
                "Content-Length" => Some(&self.content_length),
                _ => None,
            }
        }
    }

    struct Receiver {
        explorer: Arc<MockExplorer>,
        invoices: Arc<InMemoryInvoiceRepository>,
        endpoint: PayjoinEndpoint,
    }

    impl Receiver {
        /// A merchant with an invoice of `due` paid to the fixture's payment script and
        /// coins of 0.1, 0.2 and 0.05 BTC.
        fn new(fixture: &SenderFixture, due: Amount) -> Self {
            init_tracing();
            let explorer = Arc::new(MockExplorer::new());
            for (index, btc) in [(1, 0.1), (2, 0.2), (3, 0.05)] {
                let value = Amount::from_btc(btc).expect("valid amount");
                explorer.add_unspent(WALLET, receiver_coin(index, value, ScriptType::Segwit));
            }
            let invoices = Arc::new(InMemoryInvoiceRepository::new("BTC"));
            invoices.add_invoice(INVOICE, invoice_method(fixture.payment_script.clone(), due, WALLET));
            let endpoint = PayjoinEndpoint::new(
                EndpointConfig::new("BTC", Network::Regtest),
                explorer.clone(),
                invoices.clone(),
            )
            .with_ordering(UtxoOrdering::with_blind([7; 32]));
            Receiver { explorer, invoices, endpoint }
        }

        async fn submit(&self, body: &str) -> Result<PayjoinProposal, Error> {
            self.submit_to("BTC", body, CancellationToken::new()).await
        }

        async fn submit_to(
            &self,
            crypto_code: &str,
            body: &str,
            cancel: CancellationToken,
        ) -> Result<PayjoinProposal, Error> {
            self.endpoint
                .submit(crypto_code, body.as_bytes(), "v=1", HeaderMock::new(body), cancel)
                .await
        }
    }

    fn code(result: Result<PayjoinProposal, Error>) -> (ErrorCode, u16) {
        let reply = result.expect_err("the request should fail").reply();
        (reply.error_code(), reply.status_code())
    }

    fn receiver_value(tx: &Transaction, fixture: &SenderFixture) -> Amount {
        let change = p2wpkh_script(200);
        tx.output
            .iter()
            .filter(|txo| txo.script_pubkey == fixture.payment_script || txo.script_pubkey == change)
            .map(|txo| txo.value)
            .sum()
    }

    #[tokio::test]
    async fn end_to_end_payjoin() -> Result<(), BoxError> {
        let fixture = SenderFixture::default();
        let receiver = Receiver::new(&fixture, fixture.payment_value);
        let original = sender_psbt(&fixture);

        let proposal = receiver.submit(&original.to_string()).await?;
        let psbt = Psbt::from_str(proposal.body())?;
        let tx = &psbt.unsigned_tx;
        assert_eq!(tx.input.len(), 2);
        assert!(tx.output.len() == 1 || tx.output.len() == 2);

        // only the 0.05 BTC coin avoids the unnecessary input heuristic
        let contributed = Amount::from_btc(0.05)?;
        assert_eq!(receiver_value(tx, &fixture), fixture.payment_value + contributed);

        let ours = tx
            .input
            .iter()
            .position(|txin| txin.previous_output != fixture.funding_outpoint())
            .expect("receiver input");
        assert!(psbt.inputs[ours].final_script_witness.is_some());
        assert_eq!(psbt.inputs[1 - ours], Default::default());
        assert_eq!(tx.input[ours].sequence, original.unsigned_tx.input[0].sequence);

        let payments = receiver.invoices.payments(INVOICE);
        assert_eq!(payments.len(), 1);
        assert_eq!(payments[0].confirmation_count, PAYJOIN_CONFIRMATION_SENTINEL);
        let payjoin = payments[0].payjoin.as_ref().expect("payjoin information");
        assert_eq!(payjoin.proposed_txid, proposal.txid());
        assert_eq!(payjoin.contributed_outpoints, vec![tx.input[ours].previous_output]);
        assert_eq!(payjoin.coinjoin_value, fixture.payment_value);

        assert_eq!(receiver.explorer.mempool_checks(), 1);
        assert!(receiver.explorer.relayed().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn fee_rate_is_preserved() -> Result<(), BoxError> {
        let fixture =
            SenderFixture { change_value: Some(Amount::from_sat(40_000)), ..Default::default() };
        let receiver = Receiver::new(&fixture, fixture.payment_value);
        let original = sender_psbt(&fixture);
        let original_tx = sender_tx(&fixture);
        let original_rate = fixture.fee.to_sat() * 1000 / original_tx.weight().to_wu();

        let proposal = receiver.submit(&original.to_string()).await?;
        let psbt = Psbt::from_str(proposal.body())?;

        // give the sender input its signature back to weigh the final transaction
        let mut signed = psbt.clone().extract_tx_unchecked_fee_rate();
        for txin in &mut signed.input {
            if txin.previous_output == fixture.funding_outpoint() {
                txin.witness = original_tx.input[0].witness.clone();
            }
        }
        // every coin is larger than the change, so the fallback pass picks one
        let ours = psbt
            .unsigned_tx
            .input
            .iter()
            .position(|txin| txin.previous_output != fixture.funding_outpoint())
            .expect("receiver input");
        let contributed = psbt.inputs[ours].witness_utxo.as_ref().expect("coin utxo").value;
        let inputs = fixture.funding_txout().value + contributed;
        let outputs: Amount = signed.output.iter().map(|txo| txo.value).sum();
        let fee = inputs - outputs;
        assert!(fee > fixture.fee);
        assert!(fee.to_sat() * 1000 / signed.weight().to_wu() >= original_rate);

        let change = signed
            .output
            .iter()
            .find(|txo| txo.script_pubkey == p2wpkh_script(fixture.sender_seed))
            .expect("sender change");
        assert_eq!(change.value, Amount::from_sat(40_000) - (fee - fixture.fee));
        Ok(())
    }

    #[tokio::test]
    async fn second_submission_never_double_credits() -> Result<(), BoxError> {
        let fixture = SenderFixture::default();
        let receiver = Receiver::new(&fixture, fixture.payment_value);
        let body = sender_psbt(&fixture).to_string();

        receiver.submit(&body).await?;
        let (error_code, status) = code(receiver.submit(&body).await);
        assert!(
            (error_code, status) == (ErrorCode::AlreadyPaid, 422)
                || (error_code, status) == (ErrorCode::InputsAlreadyUsed, 400)
        );
        assert_eq!(receiver.invoices.payments(INVOICE).len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_original_with_same_inputs_is_refused() -> Result<(), BoxError> {
        let fixture = SenderFixture::default();
        let receiver = Receiver::new(&fixture, fixture.payment_value);
        let second_invoice = p2wpkh_script(101);
        receiver.invoices.add_invoice(
            "invoice-2",
            invoice_method(second_invoice.clone(), fixture.payment_value, WALLET),
        );

        receiver.submit(&sender_psbt(&fixture).to_string()).await?;
        let double_spend = SenderFixture { payment_script: second_invoice, ..fixture.clone() };
        let (error_code, status) =
            code(receiver.submit(&sender_psbt(&double_spend).to_string()).await);
        assert_eq!((error_code, status), (ErrorCode::InputsAlreadyUsed, 400));
        Ok(())
    }

    #[tokio::test]
    async fn receiver_never_spends_sender_inputs() -> Result<(), BoxError> {
        let fixture = SenderFixture::default();
        init_tracing();
        let explorer = Arc::new(MockExplorer::new());
        let overlapping = ReceivedCoin {
            outpoint: fixture.funding_outpoint(),
            ..receiver_coin(1, Amount::from_btc(0.05)?, ScriptType::Segwit)
        };
        explorer.add_unspent(WALLET, overlapping);
        let invoices = Arc::new(InMemoryInvoiceRepository::new("BTC"));
        invoices.add_invoice(
            INVOICE,
            invoice_method(fixture.payment_script.clone(), fixture.payment_value, WALLET),
        );
        let endpoint = PayjoinEndpoint::new(
            EndpointConfig::new("BTC", Network::Regtest),
            explorer.clone(),
            invoices.clone(),
        );

        let body = sender_psbt(&fixture).to_string();
        let result = endpoint
            .submit("BTC", body.as_bytes(), "", HeaderMock::new(&body), CancellationToken::new())
            .await;
        assert_eq!(code(result), (ErrorCode::OutOfUtxos, 503));

        // the original went out and nothing stayed locked
        assert_eq!(explorer.relayed(), vec![sender_tx(&fixture)]);
        assert!(endpoint.locks().try_lock_inputs(&[fixture.funding_outpoint()]));
        assert!(invoices.payments(INVOICE).is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn rejections_before_the_mempool_check_do_not_broadcast() {
        let fixture = SenderFixture::default();
        let receiver = Receiver::new(&fixture, fixture.payment_value);
        let body = sender_psbt(&fixture).to_string();

        let result = receiver.submit_to("LTC", &body, CancellationToken::new()).await;
        assert_eq!(code(result), (ErrorCode::InvalidNetwork, 404));

        let mut unsigned = sender_psbt(&fixture);
        unsigned.inputs[0].final_script_witness = None;
        let result = receiver.submit(&unsigned.to_string()).await;
        assert_eq!(code(result), (ErrorCode::PsbtNotFinalized, 400));

        receiver.explorer.reject_broadcasts("bad-txns-inputs-missingorspent");
        let result = receiver.submit(&body).await;
        assert_eq!(code(result), (ErrorCode::InvalidTransaction, 400));

        assert!(receiver.explorer.relayed().is_empty());
    }

    #[tokio::test]
    async fn invoice_matching_rejections() {
        let fixture = SenderFixture::default();

        let receiver = Receiver::new(&fixture, fixture.payment_value + Amount::from_sat(1));
        let result = receiver.submit(&sender_psbt(&fixture).to_string()).await;
        assert_eq!(code(result), (ErrorCode::InvoiceNotFullyPaid, 400));

        let elsewhere = SenderFixture { payment_script: p2wpkh_script(55), ..fixture.clone() };
        let result = receiver.submit(&sender_psbt(&elsewhere).to_string()).await;
        assert_eq!(code(result), (ErrorCode::InvoiceNotFound, 400));

        let receiver = Receiver::new(&fixture, fixture.payment_value);
        let mut legacy = invoice_method(p2wpkh_script(56), fixture.payment_value, WALLET);
        legacy.derivation = DerivationScheme { wallet_id: WALLET.into(), script_type: ScriptType::Legacy };
        receiver.invoices.add_invoice("legacy", legacy);
        let legacy_payment = SenderFixture { payment_script: p2wpkh_script(56), ..fixture.clone() };
        let result = receiver.submit(&sender_psbt(&legacy_payment).to_string()).await;
        assert_eq!(code(result), (ErrorCode::OutOfUtxos, 503));
    }

    #[tokio::test]
    async fn missing_hot_wallet_falls_back_to_the_original() {
        let fixture = SenderFixture::default();
        let receiver = Receiver::new(&fixture, fixture.payment_value);
        receiver.explorer.remove_signing_key();

        let result = receiver.submit(&sender_psbt(&fixture).to_string()).await;
        assert_eq!(code(result), (ErrorCode::Unavailable, 500));
        assert_eq!(receiver.explorer.relayed(), vec![sender_tx(&fixture)]);

        let coin = receiver_coin(3, Amount::from_btc(0.05).unwrap(), ScriptType::Segwit);
        assert!(!receiver.endpoint.locks().is_locked(&coin.outpoint));
        assert!(receiver.invoices.payments(INVOICE).is_empty());
    }

    #[tokio::test]
    async fn raw_transaction_round_trip() -> Result<(), BoxError> {
        let fixture = SenderFixture::default();
        let receiver = Receiver::new(&fixture, fixture.payment_value);
        receiver.explorer.add_previous_output(fixture.funding_outpoint(), fixture.funding_txout());

        let proposal = receiver.submit(&serialize_hex(&sender_tx(&fixture))).await?;
        let tx: Transaction = deserialize_hex(proposal.body())?;
        assert_eq!(tx.input.len(), 2);
        assert_eq!(tx.compute_txid(), proposal.txid());
        Ok(())
    }

    /// Never answers `list_unspent`, so requests hang after the mempool check.
    struct StuckExplorer(MockExplorer);

    #[async_trait]
    impl Explorer for StuckExplorer {
        async fn fetch_previous_outputs(
            &self,
            tx: &Transaction,
        ) -> Result<Vec<Option<TxOut>>, ImplementationError> {
            self.0.fetch_previous_outputs(tx).await
        }

        async fn broadcast(
            &self,
            tx: &Transaction,
            test_only: bool,
        ) -> Result<BroadcastResult, ImplementationError> {
            self.0.broadcast(tx, test_only).await
        }

        async fn list_unspent(
            &self,
            _scheme: &DerivationScheme,
        ) -> Result<Vec<ReceivedCoin>, ImplementationError> {
            std::future::pending().await
        }

        async fn unused_change_script(
            &self,
            scheme: &DerivationScheme,
        ) -> Result<ScriptBuf, ImplementationError> {
            self.0.unused_change_script(scheme).await
        }

        async fn signing_key(
            &self,
            scheme: &DerivationScheme,
        ) -> Result<Option<Xpriv>, ImplementationError> {
            self.0.signing_key(scheme).await
        }

        async fn is_spent(&self, outpoint: &OutPoint) -> Result<bool, ImplementationError> {
            self.0.is_spent(outpoint).await
        }
    }

    #[tokio::test]
    async fn cancellation_releases_locks_and_broadcasts() -> Result<(), BoxError> {
        init_tracing();
        let fixture = SenderFixture::default();
        let explorer = Arc::new(StuckExplorer(MockExplorer::new()));
        let invoices = Arc::new(InMemoryInvoiceRepository::new("BTC"));
        invoices.add_invoice(
            INVOICE,
            invoice_method(fixture.payment_script.clone(), fixture.payment_value, WALLET),
        );
        let endpoint = PayjoinEndpoint::new(
            EndpointConfig::new("BTC", Network::Regtest),
            explorer.clone(),
            invoices,
        );

        let cancel = CancellationToken::new();
        let timeout = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            timeout.cancel();
        });
        let body = sender_psbt(&fixture).to_string();
        let result =
            endpoint.submit("BTC", body.as_bytes(), "", HeaderMock::new(&body), cancel).await;
        assert_eq!(code(result), (ErrorCode::Unavailable, 500));

        assert_eq!(explorer.0.relayed(), vec![sender_tx(&fixture)]);
        assert!(endpoint.locks().try_lock_inputs(&[fixture.funding_outpoint()]));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn originals_are_broadcast_after_the_delay() -> Result<(), BoxError> {
        let fixture = SenderFixture::default();
        let receiver = Receiver::new(&fixture, fixture.payment_value);
        receiver.submit(&sender_psbt(&fixture).to_string()).await?;
        assert!(receiver.explorer.relayed().is_empty());

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(receiver.explorer.relayed(), vec![sender_tx(&fixture)]);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn stale_payjoins_are_swept() -> Result<(), BoxError> {
        let fixture = SenderFixture::default();
        let receiver = Receiver::new(&fixture, fixture.payment_value);
        let proposal = receiver.submit(&sender_psbt(&fixture).to_string()).await?;
        let state = receiver.endpoint.states().get_or_add(WALLET);
        assert_eq!(state.len(), 1);

        let rebroadcaster = StaleRebroadcaster::new(
            receiver.endpoint.explorer(),
            receiver.endpoint.states(),
            receiver.endpoint.locks(),
        );
        assert!(rebroadcaster.sweep().await.is_empty());

        tokio::time::sleep(Duration::from_secs(5 * 60 + 1)).await;
        let swept = rebroadcaster.sweep().await;
        assert_eq!(swept, vec![sender_tx(&fixture).compute_txid()]);
        assert!(state.is_empty());
        let payments = receiver.invoices.payments(INVOICE);
        let contributed = &payments[0].payjoin.as_ref().expect("payjoin").contributed_outpoints;
        assert!(!receiver.endpoint.locks().is_locked(&contributed[0]));
        assert_ne!(proposal.txid(), swept[0]);
        Ok(())
    }

    #[tokio::test]
    async fn settled_payjoins_are_pruned() -> Result<(), BoxError> {
        let fixture = SenderFixture::default();
        let receiver = Receiver::new(&fixture, fixture.payment_value);
        receiver.submit(&sender_psbt(&fixture).to_string()).await?;
        receiver.explorer.mark_spent(fixture.funding_outpoint());

        let rebroadcaster = StaleRebroadcaster::new(
            receiver.endpoint.explorer(),
            receiver.endpoint.states(),
            receiver.endpoint.locks(),
        );
        assert!(rebroadcaster.sweep().await.is_empty());
        assert!(receiver.endpoint.states().get_or_add(WALLET).is_empty());
        assert!(receiver.endpoint.locks().try_lock_inputs(&[fixture.funding_outpoint()]));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn rebroadcaster_sweeps_until_cancelled() -> Result<(), BoxError> {
        let fixture = SenderFixture::default();
        let receiver = Receiver::new(&fixture, fixture.payment_value);
        receiver.submit(&sender_psbt(&fixture).to_string()).await?;
        let rebroadcaster = StaleRebroadcaster::new(
            receiver.endpoint.explorer(),
            receiver.endpoint.states(),
            receiver.endpoint.locks(),
        )
        .with_interval(Duration::from_secs(1))
        .with_timeout(Duration::from_secs(2));
        let cancel = CancellationToken::new();
        let stop = cancel.clone();
        let handle = tokio::spawn(async move { rebroadcaster.run(stop).await });

        // well before the delayed broadcast of the original is due
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(receiver.explorer.relayed(), vec![sender_tx(&fixture)]);
        assert!(receiver.endpoint.states().get_or_add(WALLET).is_empty());

        cancel.cancel();
        handle.await?;
        Ok(())
    }
}
