//! Snippet tests for the whole pipeline: every scenario runs on
//! the tree walker, on the VM, and in comparison mode, and all
//! three must tell the same story.

use proptest::prelude::*;

use waxwing::{Backend, Config, Interp, Value};

fn interp(backend: Backend) -> Interp {
    Interp::new(Config {
        backend,
        ..Config::default()
    })
    .expect("core bootstrap")
}

/// Evaluates a snippet on one back end and renders the result.
fn run_on(backend: Backend, src: &str) -> String {
    let mut interp = interp(backend);
    match interp.eval(src) {
        Ok(value) => interp.show(value),
        Err(error) => panic!("{:?} failed on `{}`:\n{}", backend, src, error),
    }
}

/// Asserts a snippet's rendered result on every back end.
fn expect(src: &str, expected: &str) {
    for backend in [Backend::Walk, Backend::Vm, Backend::Compare] {
        let got = run_on(backend, src);
        assert_eq!(got, expected, "on {:?}: `{}`", backend, src);
    }
}

/// Like `expect`, but skips comparison mode: comparison re-runs
/// every form on both machines, so snippets whose side effects
/// accumulate would (correctly) observe the doubled history.
fn expect_effects(src: &str, expected: &str) {
    for backend in [Backend::Walk, Backend::Vm] {
        let got = run_on(backend, src);
        assert_eq!(got, expected, "on {:?}: `{}`", backend, src);
    }
}

/// Asserts a snippet fails on every back end.
fn expect_error(src: &str) {
    for backend in [Backend::Walk, Backend::Vm] {
        let mut interp = interp(backend);
        assert!(
            interp.eval(src).is_err(),
            "expected an error on {:?}: `{}`",
            backend,
            src
        );
    }
}

// -- arithmetic (scenario 1) -----------------------------------

#[test]
fn arithmetic() {
    expect("(+ 1 2 3)", "6");
    expect("(+)", "0");
    expect("(/ 10 2)", "5");
    expect("(/ 7 2)", "3");
    expect("(/ 7 2.0)", "3.5");
    expect("(* 2 (- 10 4))", "12");
}

#[test]
fn division_by_zero() {
    expect_error("(/ 1 0)");
    expect_error("(rem 1 0)");
}

// -- closures (scenario 2) -------------------------------------

#[test]
fn closure_capture_three_levels() {
    // the classic inherited-captures regression: the three
    // values must neither permute nor repeat
    expect(
        "((fn [x] ((fn [y] ((fn [z] [x y z]) 100)) 10)) 1)",
        "[1 10 100]",
    );
}

#[test]
fn closure_sees_construction_environment() {
    expect(
        "(def make-adder (fn [n] (fn [x] (+ x n))))
         (def add5 (make-adder 5))
         (def add7 (make-adder 7))
         [(add5 1) (add7 1)]",
        "[6 8]",
    );
}

#[test]
fn closure_over_let_locals() {
    expect(
        "(let [a 1 b 2] ((fn [] (+ a b))))",
        "3",
    );
}

// -- laziness (scenarios 3 and 4) ------------------------------

#[test]
fn take_iterate() {
    expect("(take 5 (iterate inc 0))", "(0 1 2 3 4)");
}

#[test]
fn lazy_realizes_at_most_once() {
    expect_effects(
        "(def calls (atom 0))
         (def s (map (fn [x] (swap! calls inc) x) [1 2 3]))
         (doall s)
         (doall s)
         @calls",
        "3",
    );
}

#[test]
fn fused_pipeline() {
    expect(
        "(reduce + (take 1000 (filter odd? (map (fn [x] (* x x)) (range)))))",
        "1333333000",
    );
}

#[test]
fn doall_idempotent() {
    expect("(= (doall (doall (map inc [1 2]))) (doall (map inc [1 2])))", "true");
}

#[test]
fn range_variants() {
    expect("(take 3 (range))", "(0 1 2)");
    expect("(range 2 8 2)", "(2 4 6)");
    expect("(range 3 0 -1)", "(3 2 1)");
}

// -- macros (scenario 5) ---------------------------------------

#[test]
fn syntax_quote_hygiene() {
    expect(
        "(defmacro m [e] `(let* [v# ~e] [v# v#]))
         (m 42)",
        "[42 42]",
    );
}

#[test]
fn nested_macro_calls_do_not_clash() {
    expect(
        "(defmacro m [e] `(let* [v# ~e] [v# v#]))
         (m (m 1))",
        "[[1 1] [1 1]]",
    );
}

#[test]
fn user_macro_with_body() {
    expect(
        "(defmacro unless [test & body] `(if ~test nil (do ~@body)))
         (unless false 1 2 3)",
        "3",
    );
}

#[test]
fn runaway_macro_hits_the_limit() {
    expect_error("(defmacro forever [] '(forever)) (forever)");
}

// -- dynamic vars (scenario 6) ---------------------------------

#[test]
fn dynamic_binding_scopes() {
    expect("(def ^:dynamic *x* 10) (binding [*x* 20] *x*)", "20");
    expect(
        "(def ^:dynamic *x* 10) (binding [*x* 20] *x*) *x*",
        "10",
    );
}

#[test]
fn dynamic_binding_pops_on_throw() {
    expect(
        "(def ^:dynamic *x* 10)
         (try
           (binding [*x* 20] (throw (ex-info \"boom\" {})))
           (catch _ e nil))
         *x*",
        "10",
    );
}

#[test]
fn set_bang_writes_the_binding() {
    expect(
        "(def ^:dynamic *x* 1)
         [(binding [*x* 2] (set! *x* 3) *x*) *x*]",
        "[3 1]",
    );
}

// -- loop / recur ----------------------------------------------

#[test]
fn loop_recur_counts() {
    expect("(loop [i 0 acc 0] (if (< i 10) (recur (inc i) (+ acc i)) acc))", "45");
}

#[test]
fn deep_recur_is_constant_space() {
    // a million iterations: O(1) frames or this test never ends
    expect(
        "(loop [i 0] (if (< i 1000000) (recur (inc i)) i))",
        "1000000",
    );
}

#[test]
fn fn_recur() {
    expect(
        "((fn count-down [n] (if (pos? n) (recur (dec n)) :done)) 5)",
        ":done",
    );
}

#[test]
fn recur_outside_tail_is_rejected() {
    expect_error("(loop [i 0] (+ 1 (recur (inc i))))");
}

// -- collections ------------------------------------------------

#[test]
fn collection_basics() {
    expect("(conj [1 2] 3)", "[1 2 3]");
    expect("(conj '(2 3) 1)", "(1 2 3)");
    expect("(assoc {:a 1} :b 2)", "{:a 1, :b 2}");
    expect("(dissoc {:a 1 :b 2} :a)", "{:b 2}");
    expect("(get {:a 1} :a)", "1");
    expect("(get {:a 1} :missing :default)", ":default");
    expect("(count #{1 2 3})", "3");
    expect("(nth [10 20 30] 1)", "20");
    expect("(vec '(1 2))", "[1 2]");
}

#[test]
fn collections_as_functions() {
    expect("({:a 1} :a)", "1");
    expect("(:a {:a 1})", "1");
    expect("(:missing {:a 1} :fallback)", ":fallback");
    expect("(#{1 2} 2)", "2");
    expect("([10 20] 1)", "20");
}

#[test]
fn destructuring() {
    expect("(let [[a b & more] [1 2 3 4]] [a b more])", "[1 2 (3 4)]");
    expect("(let [{:keys [a b] :or {b 9}} {:a 1}] [a b])", "[1 9]");
    expect("(let [{x :foo :as all} {:foo 7}] [x (count all)])", "[7 1]");
    expect("((fn [[a b]] (+ a b)) [3 4])", "7");
}

#[test]
fn truthiness() {
    expect("(if nil 1 2)", "2");
    expect("(if false 1 2)", "2");
    expect("(if 0 1 2)", "1");
    expect("(if '() 1 2)", "1");
    expect("(if \"\" 1 2)", "1");
}

#[test]
fn equality_laws() {
    expect("(= [1 2] [1 2])", "true");
    expect("(= 1 1.0)", "false");
    expect("(== 1 1.0)", "true");
    expect("(= {:a 1 :b 2} {:b 2 :a 1})", "true");
    expect("(= (take 2 (range)) '(0 1))", "true");
}

// -- transients -------------------------------------------------

#[test]
fn transient_round_trip() {
    expect(
        "(persistent! (conj! (conj! (transient []) 1) 2))",
        "[1 2]",
    );
}

#[test]
fn double_persistent_errors() {
    expect_error("(let [t (transient [])] (persistent! t) (persistent! t))");
}

// -- errors and try/catch --------------------------------------

#[test]
fn try_catch_finally() {
    expect_effects(
        "(def order (atom []))
         (try
           (swap! order conj :body)
           (throw (ex-info \"boom\" {:n 1}))
           (catch _ e (swap! order conj :catch))
           (finally (swap! order conj :finally)))
         @order",
        "[:body :catch :finally]",
    );
}

#[test]
fn catch_binds_payload() {
    expect(
        "(try (throw (ex-info \"boom\" {:n 1}))
              (catch _ e (ex-data e)))",
        "{:n 1}",
    );
}

#[test]
fn finally_runs_on_success() {
    expect_effects(
        "(def a (atom 0))
         [(try 42 (finally (reset! a 9))) @a]",
        "[42 9]",
    );
}

#[test]
fn uncaught_throw_propagates() {
    expect_error("(throw (ex-info \"boom\" {}))");
}

#[test]
fn undefined_symbol_is_an_analysis_error() {
    expect_error("(no-such-thing 1)");
}

// -- letfn ------------------------------------------------------

#[test]
fn letfn_mutual_recursion() {
    expect(
        "(letfn [(even2? [n] (if (zero? n) true (odd2? (dec n))))
                 (odd2? [n] (if (zero? n) false (even2? (dec n))))]
           [(even2? 10) (odd2? 7)])",
        "[true true]",
    );
}

// -- multimethods and protocols --------------------------------

#[test]
fn multimethod_dispatch() {
    expect(
        "(defmulti area :shape)
         (defmethod area :circle [s] (* 3 (:r s) (:r s)))
         (defmethod area :square [s] (* (:side s) (:side s)))
         [(area {:shape :circle :r 2}) (area {:shape :square :side 3})]",
        "[12 9]",
    );
}

#[test]
fn multimethod_respects_hierarchy() {
    expect(
        "(derive :square :shape)
         (defmulti describe identity)
         (defmethod describe :shape [_] :generic)
         (describe :square)",
        ":generic",
    );
}

#[test]
fn protocol_dispatch() {
    expect(
        "(defprotocol Sized (size-of [x]))
         (extend-type vector (size-of [v] (count v)))
         (extend-type string (size-of [s] (count s)))
         [(size-of [1 2 3]) (size-of \"hey\")]",
        "[3 3]",
    );
}

// -- atoms and friends -----------------------------------------

#[test]
fn atoms_swap_and_watch() {
    expect_effects(
        "(def a (atom 1))
         (def seen (atom []))
         (add-watch a :log (fn [k r old new] (swap! seen conj [old new])))
         (swap! a + 10)
         [@a @seen]",
        "[11 [[1 11]]]",
    );
}

#[test]
fn delay_forces_once() {
    expect_effects(
        "(def calls (atom 0))
         (def d (delay (swap! calls inc) :value))
         [@d @d @calls]",
        "[:value :value 1]",
    );
}

#[test]
fn defonce_keeps_the_first_binding() {
    expect("(defonce x 1) (defonce x 2) x", "1");
}

// -- namespaces -------------------------------------------------

#[test]
fn ns_require_and_alias() {
    expect(
        "(ns lib.util) (defn twice [x] (* 2 x))
         (ns app (:require [lib.util :as u :refer [twice]]))
         [(u/twice 3) (twice 4)]",
        "[6 8]",
    );
}

// -- the garbage collector -------------------------------------

#[test]
fn gc_stress_preserves_reachable_structure() {
    // a tiny threshold forces collections constantly; every
    // reachable structure must come through intact
    let mut interp = Interp::new(Config {
        backend: Backend::Vm,
        gc_threshold: 2048,
        ..Config::default()
    })
    .expect("core bootstrap");

    interp
        .eval("(def keeper {:name \"keeper\" :items [1 2 3]})")
        .unwrap();
    interp
        .eval("(def held (atom []))")
        .unwrap();
    let v = interp
        .eval(
            "(loop [i 0]
               (if (< i 500)
                 (do (swap! held conj (str \"item-\" i))
                     (recur (inc i)))
                 (count @held)))",
        )
        .unwrap();
    assert_eq!(v, Value::Int(500));

    let keeper = interp.eval("keeper").unwrap();
    assert_eq!(interp.show(keeper), "{:name \"keeper\", :items [1 2 3]}");
    let last = interp.eval("(last @held)").unwrap();
    assert_eq!(interp.show(last), "\"item-499\"");
}

#[test]
fn gc_keeps_closures_and_lazy_seqs() {
    let mut interp = Interp::new(Config {
        backend: Backend::Walk,
        gc_threshold: 2048,
        ..Config::default()
    })
    .expect("core bootstrap");

    interp.eval("(def base 100)").unwrap();
    interp
        .eval("(def f (let [offset 42] (fn [x] (+ x offset))))")
        .unwrap();
    interp.eval("(def s (map f (range 200)))").unwrap();
    // churn to force collections
    interp
        .eval("(loop [i 0] (if (< i 300) (recur (+ i (count (vec (range 10))) -9)) i))")
        .unwrap();

    let v = interp.eval("(f 1)").unwrap();
    assert_eq!(v, Value::Int(43));
    let tail = interp.eval("(take 3 (drop 197 s))").unwrap();
    assert_eq!(interp.show(tail), "(239 240 241)");
}

// -- properties -------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Number, string, character, and keyword literals read back
    /// to themselves.
    #[test]
    fn literal_round_trip(n in -1000000i64..1000000) {
        let src = format!("{}", n);
        let mut interp = interp(Backend::Vm);
        let v = interp.eval(&src).unwrap();
        prop_assert_eq!(interp.show(v), src);
    }

    #[test]
    fn string_round_trip(s in "[a-zA-Z0-9 _-]{0,20}") {
        let src = format!("{:?}", s);
        let mut interp = interp(Backend::Vm);
        let v = interp.eval(&src).unwrap();
        prop_assert_eq!(interp.show(v), src);
    }

    /// Random nested arithmetic agrees across back ends; the
    /// Compare back end asserts it internally too.
    #[test]
    fn backends_agree_on_arithmetic(
        a in -100i64..100,
        b in -100i64..100,
        c in 1i64..50,
    ) {
        let src = format!(
            "(let [a {a} b {b} c {c}]
               (if (odd? c)
                 (+ (* a b) (- a c) (quot b c))
                 [(+ a b) (max a b c) (min a (- b))]))"
        );
        let walk = run_on(Backend::Walk, &src);
        let vm = run_on(Backend::Vm, &src);
        let both = run_on(Backend::Compare, &src);
        prop_assert_eq!(&walk, &vm);
        prop_assert_eq!(&walk, &both);
    }

    /// assoc/get/dissoc on maps behave like a map should.
    #[test]
    fn map_laws(keys in proptest::collection::vec(0i64..20, 1..12)) {
        let mut assocs = String::new();
        for (i, k) in keys.iter().enumerate() {
            assocs.push_str(&format!("(assoc {} {})", k, i));
        }
        // thread the map through every assoc, then check the
        // last write for each key wins
        let src = format!("(-> {{}} {})", assocs);
        let mut interp = interp(Backend::Vm);
        let m = interp.eval(&src).unwrap();
        let m_src = interp.show(m);

        for k in keys.iter() {
            let last_write = keys.iter().rposition(|x| x == k).unwrap();
            let got = interp
                .eval(&format!("(get {} {})", m_src, k))
                .unwrap();
            prop_assert_eq!(got, Value::Int(last_write as i64));
        }
    }
}
